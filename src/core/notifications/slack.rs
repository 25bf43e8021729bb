use super::{
    EventKind, NotificationChannel, NotificationEvent, format_duration, human_size, short_id,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn header(text: &str) -> serde_json::Value {
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": text,
                "emoji": true
            }
        })
    }

    fn field(label: &str, value: String) -> serde_json::Value {
        json!({
            "type": "mrkdwn",
            "text": format!("*{}:*\n{}", label, value)
        })
    }

    fn format_message(&self, event: &NotificationEvent) -> serde_json::Value {
        let p = &event.payload;
        let job = format!("`{}`", short_id(&event.job_id));
        let destination = format!("`{}`", p.destination.as_deref().unwrap_or("-"));

        match event.kind {
            EventKind::Started => json!({
                "blocks": [
                    Self::header("Transfer Started"),
                    {
                        "type": "section",
                        "fields": [
                            Self::field("Project", p.project.clone()),
                            Self::field("Job ID", job),
                            Self::field("Files", format!("{} ({})", p.files_total, human_size(p.bytes_total as f64))),
                            Self::field("Destination", destination)
                        ]
                    }
                ]
            }),
            EventKind::Milestone(percent) => json!({
                "blocks": [
                    Self::header(&format!("Transfer {}% Complete", percent)),
                    {
                        "type": "section",
                        "fields": [
                            Self::field("Project", p.project.clone()),
                            Self::field("Files", format!("{}/{}", p.files_done, p.files_total)),
                            Self::field("Copied", format!(
                                "{} / {}",
                                human_size(p.bytes_copied as f64),
                                human_size(p.bytes_total as f64)
                            )),
                            Self::field("ETA", p.eta_secs.map(format_duration).unwrap_or_else(|| "unknown".to_string()))
                        ]
                    }
                ]
            }),
            EventKind::Completed => {
                let size_mb = p.bytes_copied as f64 / (1024.0 * 1024.0);
                let speed_mbps = if p.duration_secs > 0 {
                    size_mb / p.duration_secs as f64
                } else {
                    0.0
                };
                json!({
                    "blocks": [
                        Self::header("Transfer Complete"),
                        {
                            "type": "section",
                            "fields": [
                                Self::field("Project", p.project.clone()),
                                Self::field("Job ID", job),
                                Self::field("Size", format!("{:.1} MB", size_mb)),
                                Self::field("Duration", format!(
                                    "{} ({:.1} MB/s)",
                                    format_duration(p.duration_secs),
                                    speed_mbps
                                )),
                                Self::field("Errors", p.error_count.to_string()),
                                Self::field("Destination", destination)
                            ]
                        }
                    ]
                })
            }
            EventKind::Failed => json!({
                "blocks": [
                    Self::header("Transfer Failed"),
                    {
                        "type": "section",
                        "fields": [
                            Self::field("Project", p.project.clone()),
                            Self::field("Job ID", job)
                        ]
                    },
                    {
                        "type": "section",
                        "text": {
                            "type": "mrkdwn",
                            "text": format!("*Error:*\n```{}```", p.error.as_deref().unwrap_or("unknown error"))
                        }
                    }
                ]
            }),
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        let payload = self.format_message(event);
        self.client
            .post(&self.webhook_url)
            .timeout(std::time::Duration::from_secs(10))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::notifications::EventPayload;

    #[test]
    fn test_failed_message_carries_error() {
        let notifier = SlackNotifier::new("https://hooks.slack.invalid".to_string());
        let event = NotificationEvent {
            job_id: "job-1234".to_string(),
            kind: EventKind::Failed,
            payload: EventPayload {
                project: "doc".to_string(),
                error: Some("unreachable".to_string()),
                ..Default::default()
            },
        };

        let message = notifier.format_message(&event).to_string();
        assert!(message.contains("Transfer Failed"));
        assert!(message.contains("unreachable"));
        assert!(message.contains("doc"));
    }

    #[test]
    fn test_milestone_header() {
        let notifier = SlackNotifier::new("https://hooks.slack.invalid".to_string());
        let event = NotificationEvent {
            job_id: "job".to_string(),
            kind: EventKind::Milestone(75),
            payload: EventPayload::default(),
        };
        let message = notifier.format_message(&event);
        assert_eq!(message["blocks"][0]["text"]["text"], "Transfer 75% Complete");
    }
}
