use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::{
    EventKind, NotificationChannel, NotificationEvent, format_duration, human_size, short_id,
};

pub struct DiscordNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &NotificationEvent) -> String {
        let p = &event.payload;
        let destination = p.destination.as_deref().unwrap_or("-");
        let total = human_size(p.bytes_total as f64);

        match event.kind {
            EventKind::Started => format!(
                "🚀 **Transfer started** · {}\n📁 {} files · {}\n📍 `{}`",
                p.project, p.files_total, total, destination
            ),
            EventKind::Milestone(percent) => {
                let eta = match p.eta_secs {
                    Some(0) | None => "almost done".to_string(),
                    Some(secs) => format!("{} remaining", format_duration(secs)),
                };
                format!(
                    "📊 **{}% complete** · {}\n📁 {}/{} files · {} / {}\n⏱ {}",
                    percent,
                    p.project,
                    p.files_done,
                    p.files_total,
                    human_size(p.bytes_copied as f64),
                    total,
                    eta
                )
            }
            EventKind::Completed => {
                let avg = if p.duration_secs > 0 {
                    p.bytes_copied as f64 / p.duration_secs as f64
                } else {
                    0.0
                };
                let errors = if p.error_count > 0 {
                    format!(" · {} error(s)", p.error_count)
                } else {
                    String::new()
                };
                format!(
                    "✅ **Transfer complete** · {}\n📁 {} files · {}{}\n📍 `{}`\n⏱ Duration: {} · Avg: {}/s",
                    p.project,
                    p.files_total,
                    total,
                    errors,
                    destination,
                    format_duration(p.duration_secs),
                    human_size(avg)
                )
            }
            EventKind::Failed => format!(
                "❌ **Transfer failed** · {} (`{}`)\n📁 {}/{} files copied\n```{}```",
                p.project,
                short_id(&event.job_id),
                p.files_done,
                p.files_total,
                p.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

#[async_trait]
impl NotificationChannel for DiscordNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        let payload = json!({ "content": self.format_message(event) });
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
