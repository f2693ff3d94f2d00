//! netra-store: record store for enrolled students and attendance.
//!
//! The verification pipeline only sees the narrow [`RecordStore`] trait.
//! [`SqliteStore`] is the production implementation; attendance uniqueness
//! over `(student, date, subject, time slot)` is enforced by the schema.

use chrono::{Local, NaiveDate, NaiveDateTime};
use netra_core::{Embedding, LectureContext, StudentRecord};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS students (
        roll_no TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        student_class TEXT NOT NULL,
        parent_phone_number TEXT,
        department TEXT,
        embedding BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS attendance_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        roll_no TEXT NOT NULL,
        name TEXT NOT NULL,
        attendance_date TEXT NOT NULL,
        subject TEXT NOT NULL,
        teacher TEXT NOT NULL,
        hall TEXT NOT NULL,
        time_slot TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        UNIQUE(roll_no, attendance_date, subject, time_slot)
    );
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection poisoned by a panicked writer")]
    Poisoned,
}

/// What the verification pipeline needs from persistent storage.
pub trait RecordStore: Send + Sync {
    /// Every enrolled student with their embedding.
    fn load_all_embeddings(&self) -> Result<Vec<StudentRecord>, StoreError>;

    /// Current class of a student, or `None` if not enrolled.
    fn get_class(&self, student_id: &str) -> Result<Option<String>, StoreError>;

    /// Store one attendance event for today.
    ///
    /// Idempotent: returns `Ok(false)` if an event for the same
    /// `(student, date, subject, time slot)` already exists.
    fn record_attendance(
        &self,
        student_id: &str,
        name: &str,
        lecture: &LectureContext,
    ) -> Result<bool, StoreError>;
}

/// Enrollment data for one student, as produced by the registration workflow.
#[derive(Debug, Clone)]
pub struct NewStudent<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub class: &'a str,
    pub parent_phone: Option<&'a str>,
    pub department: Option<&'a str>,
    pub embedding: &'a Embedding,
}

/// One stored attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub student_id: String,
    pub name: String,
    pub date: String,
    pub subject: String,
    pub teacher: String,
    pub hall: String,
    pub time_slot: String,
    pub timestamp: String,
}

/// A student with no attendance for a lecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Absentee {
    pub student_id: String,
    pub name: String,
    pub class: String,
    pub parent_phone: Option<String>,
}

/// SQLite-backed record store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened record store");
        Self::with_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert or replace an enrolled student.
    pub fn upsert_student(&self, student: &NewStudent<'_>) -> Result<(), StoreError> {
        self.conn()?.execute(
            "REPLACE INTO students
                 (roll_no, name, student_class, parent_phone_number, department, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                student.id,
                student.name,
                student.class,
                student.parent_phone,
                student.department,
                student.embedding.to_bytes(),
            ],
        )?;
        Ok(())
    }

    /// Like [`RecordStore::record_attendance`] with an explicit clock.
    pub fn record_attendance_at(
        &self,
        student_id: &str,
        name: &str,
        lecture: &LectureContext,
        at: NaiveDateTime,
    ) -> Result<bool, StoreError> {
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO attendance_records
                 (roll_no, name, attendance_date, subject, teacher, hall, time_slot, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                student_id,
                name,
                at.format(DATE_FORMAT).to_string(),
                lecture.subject,
                lecture.teacher,
                lecture.hall,
                lecture.time_slot,
                at.format(TIMESTAMP_FORMAT).to_string(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Attendance rows for a date, newest first.
    pub fn attendance_records(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, roll_no, name, attendance_date, subject, teacher, hall, time_slot, timestamp
             FROM attendance_records WHERE attendance_date = ?1 ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
            Ok(AttendanceRecord {
                id: row.get(0)?,
                student_id: row.get(1)?,
                name: row.get(2)?,
                date: row.get(3)?,
                subject: row.get(4)?,
                teacher: row.get(5)?,
                hall: row.get(6)?,
                time_slot: row.get(7)?,
                timestamp: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Enrolled students with no attendance for the given lecture, by roll number.
    pub fn absentees(
        &self,
        date: NaiveDate,
        subject: &str,
        time_slot: &str,
    ) -> Result<Vec<Absentee>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.roll_no, s.name, s.student_class, s.parent_phone_number
             FROM students s
             WHERE NOT EXISTS (
                 SELECT 1 FROM attendance_records a
                 WHERE a.roll_no = s.roll_no
                   AND a.attendance_date = ?1 AND a.subject = ?2 AND a.time_slot = ?3
             )
             ORDER BY s.roll_no",
        )?;
        let rows = stmt.query_map(
            params![date.format(DATE_FORMAT).to_string(), subject, time_slot],
            |row| {
                Ok(Absentee {
                    student_id: row.get(0)?,
                    name: row.get(1)?,
                    class: row.get(2)?,
                    parent_phone: row.get(3)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

impl RecordStore for SqliteStore {
    fn load_all_embeddings(&self) -> Result<Vec<StudentRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT roll_no, name, student_class, embedding FROM students ORDER BY roll_no",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(3)?;
            Ok((id, row.get::<_, String>(1)?, row.get::<_, String>(2)?, blob))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, name, class, blob) = row?;
            let embedding = Embedding::from_bytes(&blob).unwrap_or_else(|| {
                tracing::warn!(student = %id, bytes = blob.len(), "undecodable embedding blob");
                Embedding::new(Vec::new())
            });
            records.push(StudentRecord {
                id,
                name,
                class,
                embedding,
            });
        }
        Ok(records)
    }

    fn get_class(&self, student_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT student_class FROM students WHERE roll_no = ?1",
                params![student_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn record_attendance(
        &self,
        student_id: &str,
        name: &str,
        lecture: &LectureContext,
    ) -> Result<bool, StoreError> {
        self.record_attendance_at(student_id, name, lecture, Local::now().naive_local())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lecture(subject: &str, slot: &str) -> LectureContext {
        LectureContext {
            subject: subject.into(),
            teacher: "Prof. Rao".into(),
            hall: "H-101".into(),
            time_slot: slot.into(),
            class: None,
        }
    }

    fn enroll(store: &SqliteStore, id: &str, class: &str, values: Vec<f32>) {
        let embedding = Embedding::new(values);
        store
            .upsert_student(&NewStudent {
                id,
                name: &format!("Student {id}"),
                class,
                parent_phone: Some("919800000000"),
                department: Some("CO"),
                embedding: &embedding,
            })
            .unwrap();
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn test_embeddings_roundtrip_through_blob() {
        let store = SqliteStore::open_in_memory().unwrap();
        enroll(&store, "S2", "SYCO", vec![0.0, 1.0]);
        enroll(&store, "S1", "TYCO", vec![0.5, -0.25]);

        let records = store.load_all_embeddings().unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S2"]);
        assert_eq!(records[0].embedding.values, vec![0.5, -0.25]);
        assert_eq!(records[0].class, "TYCO");
    }

    #[test]
    fn test_get_class() {
        let store = SqliteStore::open_in_memory().unwrap();
        enroll(&store, "S1", "SYCO", vec![1.0]);
        assert_eq!(store.get_class("S1").unwrap().as_deref(), Some("SYCO"));
        assert_eq!(store.get_class("nobody").unwrap(), None);
    }

    #[test]
    fn test_record_attendance_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let lec = lecture("DBMS", "10:00-11:00");
        assert!(store.record_attendance("S1", "Student S1", &lec).unwrap());
        assert!(!store.record_attendance("S1", "Student S1", &lec).unwrap());

        let today = Local::now().date_naive();
        assert_eq!(store.attendance_records(today).unwrap().len(), 1);
    }

    #[test]
    fn test_distinct_slots_are_distinct_events() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t = at("2026-10-14", "10:05:00");
        assert!(store.record_attendance_at("S1", "A", &lecture("DBMS", "10-11"), t).unwrap());
        assert!(store.record_attendance_at("S1", "A", &lecture("DBMS", "11-12"), t).unwrap());
        assert!(store.record_attendance_at("S1", "A", &lecture("OS", "10-11"), t).unwrap());
        let next_day = at("2026-10-15", "10:05:00");
        assert!(store.record_attendance_at("S1", "A", &lecture("DBMS", "10-11"), next_day).unwrap());

        let day = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        let rows = store.attendance_records(day).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.date == "2026-10-14" && r.hall == "H-101"));
    }

    #[test]
    fn test_absentees_for_lecture() {
        let store = SqliteStore::open_in_memory().unwrap();
        enroll(&store, "S1", "TYCO", vec![1.0]);
        enroll(&store, "S2", "TYCO", vec![1.0]);
        enroll(&store, "S3", "TYCO", vec![1.0]);
        let t = at("2026-10-14", "09:10:00");
        store.record_attendance_at("S2", "Student S2", &lecture("CN", "9-10"), t).unwrap();
        store.record_attendance_at("S3", "Student S3", &lecture("OS", "9-10"), t).unwrap();

        let day = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        let absent = store.absentees(day, "CN", "9-10").unwrap();
        let ids: Vec<_> = absent.iter().map(|a| a.student_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S3"]);
        assert_eq!(absent[0].parent_phone.as_deref(), Some("919800000000"));
    }

    #[test]
    fn test_undecodable_blob_yields_empty_embedding() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO students (roll_no, name, student_class, embedding) VALUES ('X', 'x', 'c', ?1)",
                params![vec![1u8, 2, 3]],
            )
            .unwrap();
        let records = store.load_all_embeddings().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].embedding.values.is_empty());
    }

    #[test]
    fn test_open_file_persists_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netra.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            enroll(&store, "S1", "TYCO", vec![1.0, 2.0]);
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.load_all_embeddings().unwrap().len(), 1);
    }
}
