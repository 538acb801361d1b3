//! Transport adapters: the concrete `send_<tag>` functions registered into
//! `fleet_core::TransportRegistry` at startup. `fleet-core` only knows how to
//! call a `TransportFn`; everything here about wire formats and credentials
//! is out of its scope (spec §1, §4.3.1).

use std::sync::Arc;

use fleet_core::{Notification, TransportFn};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as MailMessage, Tokio1Executor};
use tracing::{error, warn};

use crate::config::{SmtpTransportConfig, TwilioTransportConfig};

/// Webhook-style transports (Discord, Mattermost, Slack) all take the same
/// `{"content": message}` POST body (`notify_discord.py` / `notify_mattermost.py`).
fn webhook_transport(tag: &'static str, client: reqwest::Client) -> TransportFn {
    Arc::new(move |notification: Notification| {
        let client = client.clone();
        Box::pin(async move {
            let Some(url) = notification
                .recipient
                .setting(tag, "webhook_url")
                .and_then(|v| v.as_str())
                .map(str::to_owned)
            else {
                warn!(tag, "notification enabled but no webhook_url configured");
                return;
            };

            let body = serde_json::json!({ "content": notification.message });
            if let Err(e) = client.post(&url).json(&body).send().await {
                error!(tag, error = %e, "webhook delivery failed");
            }
        })
    })
}

pub fn discord_transport(client: reqwest::Client) -> TransportFn {
    webhook_transport("discord", client)
}

pub fn mattermost_transport(client: reqwest::Client) -> TransportFn {
    webhook_transport("mattermost", client)
}

pub fn slack_transport(client: reqwest::Client) -> TransportFn {
    // Slack's incoming-webhook payload shape is the same `content`-as-`text`
    // convention once relabeled; `notify_slack.py` posts `{"text": message}`.
    Arc::new(move |notification: Notification| {
        let client = client.clone();
        Box::pin(async move {
            let Some(url) = notification
                .recipient
                .setting("slack", "webhook_url")
                .and_then(|v| v.as_str())
                .map(str::to_owned)
            else {
                warn!("notification enabled but no webhook_url configured for slack");
                return;
            };

            let body = serde_json::json!({ "text": notification.message });
            if let Err(e) = client.post(&url).json(&body).send().await {
                error!(error = %e, "slack delivery failed");
            }
        })
    })
}

/// Twilio SMS, grounded in `notify_twilio.py`'s Messages.json POST with HTTP
/// basic auth. Recipient settings carry the destination `to` number; the
/// account credentials and the `from` number are process-wide.
pub fn twilio_transport(client: reqwest::Client, creds: TwilioTransportConfig, from_number: String) -> TransportFn {
    Arc::new(move |notification: Notification| {
        let client = client.clone();
        let creds = creds.clone();
        let from_number = from_number.clone();
        Box::pin(async move {
            let Some(to_number) = notification
                .recipient
                .setting("twilio", "to_number")
                .and_then(|v| v.as_str())
                .map(str::to_owned)
            else {
                warn!("notification enabled but no to_number configured for twilio");
                return;
            };

            if creds.account_sid.is_empty() || creds.auth_token.is_empty() {
                error!("twilio transport enabled but account_sid/auth_token missing");
                return;
            }

            let url = format!(
                "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
                creds.account_sid
            );
            let form = [
                ("To", to_number.as_str()),
                ("From", from_number.as_str()),
                ("Body", notification.message.as_str()),
            ];

            let result = client
                .post(&url)
                .basic_auth(&creds.account_sid, Some(&creds.auth_token))
                .form(&form)
                .send()
                .await;

            if let Err(e) = result {
                error!(error = %e, "twilio delivery failed");
            }
        })
    })
}

/// SMTP, grounded in `notify_smtp.py`. Recipient settings carry the
/// destination address; server/credentials are process-wide.
pub fn smtp_transport(config: SmtpTransportConfig, from_address: String) -> TransportFn {
    Arc::new(move |notification: Notification| {
        let config = config.clone();
        let from_address = from_address.clone();
        Box::pin(async move {
            let Some(to_address) = notification
                .recipient
                .setting("smtp", "to_address")
                .and_then(|v| v.as_str())
                .map(str::to_owned)
            else {
                warn!("notification enabled but no to_address configured for smtp");
                return;
            };

            if config.server.is_empty() {
                error!("smtp transport enabled but no server configured");
                return;
            }

            let email = match build_email(&from_address, &to_address, &notification.message) {
                Ok(email) => email,
                Err(e) => {
                    error!(error = %e, "failed to build notification email");
                    return;
                }
            };

            let transport = if config.start_tls {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.server)
            };
            let transport = match transport {
                Ok(builder) => builder
                    .port(config.submission_port)
                    .credentials(Credentials::new(config.username.clone(), config.password.clone()))
                    .build(),
                Err(e) => {
                    error!(error = %e, "failed to configure smtp transport");
                    return;
                }
            };

            if let Err(e) = transport.send(email).await {
                error!(error = %e, "smtp delivery failed");
            }
        })
    })
}

fn build_email(from: &str, to: &str, body: &str) -> Result<MailMessage, Box<dyn std::error::Error>> {
    let from: Mailbox = from.parse()?;
    let to: Mailbox = to.parse()?;
    Ok(MailMessage::builder()
        .from(from)
        .to(to)
        .subject("fleet-monitor alert")
        .body(body.to_owned())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::NotificationConfig;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A minimal raw-socket HTTP/1.1 server: accepts one request, reads its
    /// body, hands it to the test, and replies 200 with an empty body.
    async fn capture_one_post_body(listener: TcpListener) -> serde_json::Value {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let body_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let Some(header_end) = find_subslice(&buf, b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&buf[..header_end]);
            let content_length: usize = headers
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_owned()))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let body_start = header_end + 4;
            if buf.len() - body_start >= content_length {
                break body_start + content_length;
            }
        };
        let header_end = find_subslice(&buf, b"\r\n\r\n").unwrap();
        let body_bytes = &buf[header_end + 4..body_end];
        let parsed = serde_json::from_slice(body_bytes).unwrap();
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await;
        parsed
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[tokio::test]
    async fn discord_transport_posts_content_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let capture = tokio::spawn(capture_one_post_body(listener));

        let transport = discord_transport(reqwest::Client::new());
        let mut recipient = NotificationConfig::new().allow("discord", true);
        recipient
            .settings
            .entry("discord".to_owned())
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .unwrap()
            .insert("webhook_url".to_owned(), json!(format!("http://{addr}/webhook")));

        transport(Notification {
            message: "node1 disconnected".to_owned(),
            recipient,
        })
        .await;

        let body = capture.await.unwrap();
        assert_eq!(body["content"], "node1 disconnected");
    }

    #[tokio::test]
    async fn discord_transport_without_webhook_url_does_not_panic() {
        let transport = discord_transport(reqwest::Client::new());
        transport(Notification {
            message: "hello".to_owned(),
            recipient: NotificationConfig::new().allow("discord", true),
        })
        .await;
    }
}
