use anyhow::{Context, Result, anyhow};
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use crate::core::{JobRecord, JobStatusEntry, JobSummary, JobWithHistory};

const SUMMARY_COLUMNS: &str = "j.id, j.project,
     COALESCE((SELECT status FROM job_status_log WHERE job_id = j.id
               ORDER BY created_at DESC, id DESC LIMIT 1), 'unknown') AS status,
     j.created_at, j.finished_at";

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobSummary> {
    Ok(JobSummary {
        id: row.get(0)?,
        project: row.get(1)?,
        status: row.get(2)?,
        created_at: row.get(3)?,
        finished_at: row.get(4)?,
    })
}

pub async fn create(conn: &Connection, job_id: String, project: String) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "INSERT INTO jobs (id, project) VALUES (?1, ?2)",
            params![&job_id, &project],
        )?;

        let log_id = Uuid::now_v7().to_string();
        tx.execute(
            "INSERT INTO job_status_log (id, job_id, status, description)
             VALUES (?1, ?2, 'idle', 'Job accepted')",
            params![log_id, &job_id],
        )?;

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn update_status(
    conn: &Connection,
    job_id: String,
    status: &str,
    description: Option<String>,
) -> Result<()> {
    let status = status.to_string();
    conn.call(move |c| {
        let log_id = Uuid::now_v7().to_string();
        c.execute(
            "INSERT INTO job_status_log (id, job_id, status, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![log_id, job_id, status, description],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

/// Archive the terminal record of a job.
pub async fn finish(conn: &Connection, record: &JobRecord) -> Result<()> {
    let json = serde_json::to_string(record).context("Failed to serialize job record")?;
    let job_id = record.id.clone();
    let finished_at = record.finished_at.to_rfc3339();

    let updated = conn
        .call(move |c| {
            let n = c.execute(
                "UPDATE jobs SET finished_at = ?1, record = ?2 WHERE id = ?3",
                params![finished_at, json, job_id],
            )?;
            Ok::<usize, rusqlite::Error>(n)
        })
        .await?;

    if updated == 0 {
        return Err(anyhow!("Job {} not found", record.id));
    }
    Ok(())
}

/// Newest jobs first.
pub async fn list(conn: &Connection, limit: u32, offset: u32) -> Result<Vec<JobSummary>> {
    let jobs = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {} FROM jobs j ORDER BY j.id DESC LIMIT ?1 OFFSET ?2",
                SUMMARY_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit, offset], summary_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| anyhow!("Failed to list jobs: {}", e))?;

    Ok(jobs)
}

pub async fn get_with_history(conn: &Connection, job_id: String) -> Result<Option<JobWithHistory>> {
    let row = conn
        .call(move |c| {
            let summary = c
                .query_row(
                    &format!("SELECT {} FROM jobs j WHERE j.id = ?1", SUMMARY_COLUMNS),
                    params![&job_id],
                    summary_from_row,
                )
                .optional()?;
            let Some(summary) = summary else {
                return Ok(None);
            };

            let record: Option<String> = c.query_row(
                "SELECT record FROM jobs WHERE id = ?1",
                params![&job_id],
                |row| row.get(0),
            )?;

            let mut stmt = c.prepare(
                "SELECT status, description, created_at FROM job_status_log
                 WHERE job_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let history = stmt
                .query_map(params![&job_id], |row| {
                    Ok(JobStatusEntry {
                        status: row.get(0)?,
                        description: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok::<_, rusqlite::Error>(Some((summary, record, history)))
        })
        .await
        .map_err(|e| anyhow!("Failed to get job: {}", e))?;

    let Some((summary, record, history)) = row else {
        return Ok(None);
    };
    let record = record
        .map(|json| serde_json::from_str::<JobRecord>(&json))
        .transpose()
        .context("Stored job record is corrupt")?;

    Ok(Some(JobWithHistory {
        summary,
        record,
        history,
    }))
}

/// Most recent archived record.
pub async fn latest(conn: &Connection) -> Result<Option<JobRecord>> {
    let json = conn
        .call(|c| {
            c.query_row(
                "SELECT record FROM jobs WHERE record IS NOT NULL ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
        .map_err(|e| anyhow!("Failed to read latest job: {}", e))?;

    json.map(|json| serde_json::from_str(&json).context("Stored job record is corrupt"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobState;
    use chrono::Utc;

    fn record(id: &str) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            project: "wedding".to_string(),
            state: JobState::Completed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_secs: 12,
            destination: Some("//nas/archive/wedding".to_string()),
            files_total: 3,
            files_copied: 3,
            files_failed: 0,
            files_verify_failed: 0,
            bytes_total: 300,
            bytes_copied: 300,
            error_count: 0,
            error: None,
            failed_files: vec![],
            milestones_notified: vec![25, 50, 75, 100],
        }
    }

    #[tokio::test]
    async fn test_job_lifecycle_round_trip() {
        let conn = crate::db::init_in_memory().await.unwrap();
        let id = Uuid::now_v7().to_string();

        create(&conn, id.clone(), "wedding".to_string()).await.unwrap();
        update_status(&conn, id.clone(), "mounting", None).await.unwrap();
        update_status(&conn, id.clone(), "completed", None).await.unwrap();
        finish(&conn, &record(&id)).await.unwrap();

        let job = get_with_history(&conn, id.clone()).await.unwrap().unwrap();
        assert_eq!(job.summary.status, "completed");
        assert_eq!(job.summary.project, "wedding");
        assert!(job.summary.finished_at.is_some());
        let statuses: Vec<_> = job.history.iter().map(|h| h.status.as_str()).collect();
        assert_eq!(statuses, vec!["idle", "mounting", "completed"]);
        let stored = job.record.unwrap();
        assert_eq!(stored.files_copied, 3);
        assert_eq!(stored.milestones_notified, vec![25, 50, 75, 100]);
        assert_eq!(stored.destination.as_deref(), Some("//nas/archive/wedding"));

        assert_eq!(latest(&conn).await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let conn = crate::db::init_in_memory().await.unwrap();
        let first = Uuid::now_v7().to_string();
        let second = Uuid::now_v7().to_string();
        create(&conn, first.clone(), "a".to_string()).await.unwrap();
        create(&conn, second.clone(), "b".to_string()).await.unwrap();

        let jobs = list(&conn, 10, 0).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, second);
        assert_eq!(jobs[0].status, "idle");

        let page = list(&conn, 1, 1).await.unwrap();
        assert_eq!(page[0].id, first);
    }

    #[tokio::test]
    async fn test_missing_job() {
        let conn = crate::db::init_in_memory().await.unwrap();
        assert!(get_with_history(&conn, "nope".to_string()).await.unwrap().is_none());
        assert!(latest(&conn).await.unwrap().is_none());
        assert!(finish(&conn, &record("nope")).await.is_err());
    }
}
