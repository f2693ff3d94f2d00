use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "netra", about = "Netra attendance CLI")]
struct Cli {
    /// Base URL of the netrad HTTP API
    #[arg(long, env = "NETRA_SERVER", default_value = "http://127.0.0.1:8000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a verification session for a lecture
    Start {
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        teacher: Option<String>,
        #[arg(long)]
        hall: Option<String>,
        #[arg(long)]
        time_slot: Option<String>,
        /// Only record students of this class
        #[arg(long)]
        class: Option<String>,
    },
    /// Stop the running session
    Stop,
    /// Show daemon and session status
    Status,
    /// Show attendance confirmed by the current session
    Attendance,
    /// List stored attendance records for a date (default: today)
    Records {
        /// Date as YYYY-MM-DD
        #[arg(long)]
        date: Option<String>,
    },
    /// List students with no attendance for a lecture
    Absentees {
        /// Date as YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        time_slot: String,
    },
    /// List local V4L2 capture devices
    Devices,
}

/// JSON body for `start_verification`. Unset fields are omitted so the
/// daemon applies its defaults.
fn start_body(
    subject: Option<String>,
    teacher: Option<String>,
    hall: Option<String>,
    time_slot: Option<String>,
    class: Option<String>,
) -> Value {
    let mut lecture = serde_json::Map::new();
    for (key, value) in [
        ("subject", subject),
        ("teacher", teacher),
        ("hall", hall),
        ("time_slot", time_slot),
        ("class", class),
    ] {
        if let Some(value) = value {
            lecture.insert(key.to_string(), Value::String(value));
        }
    }
    if lecture.is_empty() {
        json!({})
    } else {
        json!({ "current_lecture": lecture })
    }
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("{}/api/attendance", base.trim_end_matches('/')),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        tracing::debug!(path, ?query, "GET");
        let response = self
            .http
            .get(format!("{}/{path}", self.base))
            .query(query)
            .send()
            .await
            .with_context(|| format!("netrad not reachable at {}", self.base))?;
        Self::decode(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        tracing::debug!(path, %body, "POST");
        let response = self
            .http
            .post(format!("{}/{path}", self.base))
            .json(body)
            .send()
            .await
            .with_context(|| format!("netrad not reachable at {}", self.base))?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let detail = body["detail"].as_str().unwrap_or("no detail");
            bail!("{status}: {detail}");
        }
        Ok(body)
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.server);

    match cli.command {
        Commands::Start {
            subject,
            teacher,
            hall,
            time_slot,
            class,
        } => {
            let body = start_body(subject, teacher, hall, time_slot, class);
            let reply = client.post("start_verification", &body).await?;
            println!("{}", reply["status"].as_str().unwrap_or("started"));
        }
        Commands::Stop => {
            let reply = client.post("stop_verification", &json!({})).await?;
            println!("{}", reply["status"].as_str().unwrap_or("stopped"));
        }
        Commands::Status => {
            print_json(&client.get("status", &[]).await?)?;
        }
        Commands::Attendance => {
            let snapshot = client.get("get_attendance", &[]).await?;
            match snapshot.as_object() {
                Some(entries) if !entries.is_empty() => {
                    for (id, entry) in entries {
                        println!(
                            "{id}\t{}\t{}",
                            entry["name"].as_str().unwrap_or("?"),
                            entry["timestamp"].as_str().unwrap_or("?")
                        );
                    }
                }
                _ => println!("No attendance confirmed"),
            }
        }
        Commands::Records { date } => {
            let query: Vec<_> = date.map(|d| ("date", d)).into_iter().collect();
            print_json(&client.get("records", &query).await?)?;
        }
        Commands::Absentees {
            date,
            subject,
            time_slot,
        } => {
            let mut query = vec![("subject", subject), ("time_slot", time_slot)];
            if let Some(date) = date {
                query.push(("date", date));
            }
            print_json(&client.get("absentees", &query).await?)?;
        }
        Commands::Devices => {
            let devices = netra_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for device in devices {
                println!("{}\t{}\t{} ({})", device.path, device.name, device.driver, device.bus);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_body_omits_unset_fields() {
        let body = start_body(Some("DBMS".into()), None, None, Some("10-11".into()), None);
        assert_eq!(
            body,
            json!({ "current_lecture": { "subject": "DBMS", "time_slot": "10-11" } })
        );
        assert_eq!(start_body(None, None, None, None, None), json!({}));
    }

    #[test]
    fn test_parse_absentees() {
        let cli = Cli::try_parse_from([
            "netra",
            "--server",
            "http://lab:9000/",
            "absentees",
            "--subject",
            "CN",
            "--time-slot",
            "9-10",
        ])
        .unwrap();
        assert_eq!(cli.server, "http://lab:9000/");
        assert!(matches!(
            cli.command,
            Commands::Absentees { ref subject, date: None, .. } if subject == "CN"
        ));
        assert_eq!(Client::new(&cli.server).base, "http://lab:9000/api/attendance");
    }

    #[test]
    fn test_absentees_requires_subject() {
        assert!(Cli::try_parse_from(["netra", "absentees", "--time-slot", "9-10"]).is_err());
    }
}
