use async_trait::async_trait;
use blackraven_transfer::format_file_size;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::mechanism::{DeliveryError, DeliveryMechanism, DeliveryReceipt, DeliveryRequest};

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_tls")]
    pub tls: bool,
    pub from_address: String,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_tls() -> bool {
    true
}

/// Sends the payload as an attachment over SMTP.
pub struct EmailDelivery {
    config: SmtpConfig,
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for EmailDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailDelivery")
            .field("smtp_host", &self.config.smtp_host)
            .field("smtp_port", &self.config.smtp_port)
            .field("from", &self.config.from_address)
            .finish()
    }
}

impl EmailDelivery {
    pub fn new(config: SmtpConfig) -> Result<Self, DeliveryError> {
        let from = parse_from(&config.from_address)?;
        let transport = build_transport(&config)?;
        Ok(Self {
            config,
            from,
            transport,
        })
    }
}

#[async_trait]
impl DeliveryMechanism for EmailDelivery {
    async fn deliver(&self, request: &DeliveryRequest<'_>) -> Result<DeliveryReceipt, DeliveryError> {
        debug!(transfer_id = %request.transfer_id, to = %request.recipient, "building delivery email");
        let message = build_message(&self.from, request)?;

        let response = self.transport.send(message).await.map_err(|e| {
            error!(transfer_id = %request.transfer_id, to = %request.recipient, error = %e, "SMTP send failed");
            map_smtp_error(&e)
        })?;

        let reference = smtp_reference(response.code(), response.message());
        info!(transfer_id = %request.transfer_id, to = %request.recipient, reference = %reference, "delivery email sent");
        Ok(DeliveryReceipt {
            reference,
            mechanism: self.mechanism_name(),
        })
    }

    fn mechanism_name(&self) -> &'static str {
        "smtp"
    }
}

fn parse_from(address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .parse()
        .map_err(|e| DeliveryError::Configuration(format!("invalid from address: {e}")))
}

pub(crate) fn subject_line(sender: &str) -> String {
    format!("{sender} has shared files with you via BlackRaven")
}

pub(crate) fn render_text_body(request: &DeliveryRequest<'_>) -> String {
    let mut body = format!("{} has shared files with you via BlackRaven.\n\n", request.sender);
    if let Some(message) = request.message {
        body.push_str(&format!("Message: {message}\n\n"));
    }
    body.push_str(&format!(
        "Files:\n- {} ({})\n\n",
        request.filename,
        format_file_size(request.payload.len() as u64)
    ));
    match request.access_url {
        Some(url) => body.push_str(&format!("The file is attached. You can also access it here:\n{url}\n\n")),
        None => body.push_str("The file is attached to this message.\n\n"),
    }
    body.push_str("This is an automated message from BlackRaven.\n");
    body
}

/// The server's acceptance line, e.g. `250 2.0.0 Ok: queued as 4F1C2`.
fn smtp_reference<'a>(code: impl std::fmt::Display, lines: impl Iterator<Item = &'a str>) -> String {
    let text = lines.collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        code.to_string()
    } else {
        format!("{code} {text}")
    }
}

pub(crate) fn render_html_body(request: &DeliveryRequest<'_>) -> String {
    let mut body = format!(
        "<p><strong>{}</strong> has shared files with you via BlackRaven.</p>\n",
        escape_html(request.sender)
    );
    if let Some(message) = request.message {
        body.push_str(&format!("<p><em>Message:</em> {}</p>\n", escape_html(message)));
    }
    body.push_str(&format!(
        "<p>Files:</p>\n<ul><li>{} ({})</li></ul>\n",
        escape_html(request.filename),
        format_file_size(request.payload.len() as u64)
    ));
    match request.access_url {
        Some(url) => body.push_str(&format!(
            "<p>The file is attached. You can also <a href=\"{}\">access it here</a>.</p>\n",
            escape_html(url)
        )),
        None => body.push_str("<p>The file is attached to this message.</p>\n"),
    }
    body.push_str("<p><small>This is an automated message from BlackRaven.</small></p>\n");
    body
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn build_message(from: &Mailbox, request: &DeliveryRequest<'_>) -> Result<Message, DeliveryError> {
    let to: Mailbox = request
        .recipient
        .parse()
        .map_err(|e| DeliveryError::InvalidRecipient(format!("{}: {e}", request.recipient)))?;

    let content_type = ContentType::parse(request.media_type)
        .or_else(|_| ContentType::parse("application/octet-stream"))
        .map_err(|e| DeliveryError::Configuration(format!("content type: {e}")))?;

    let attachment =
        Attachment::new(request.filename.to_string()).body(request.payload.to_vec(), content_type);

    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(subject_line(request.sender))
        .multipart(
            MultiPart::mixed()
                .multipart(
                    MultiPart::alternative()
                        .singlepart(SinglePart::plain(render_text_body(request)))
                        .singlepart(SinglePart::html(render_html_body(request))),
                )
                .singlepart(attachment),
        )
        .map_err(|e| DeliveryError::Rejected(format!("failed to build email: {e}")))
}

fn build_transport(config: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
    let builder = if config.tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| DeliveryError::Configuration(format!("SMTP TLS relay error: {e}")))?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
    };

    let builder = builder.port(config.smtp_port);

    let builder = if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        builder.credentials(Credentials::new(user.clone(), pass.clone()))
    } else {
        builder
    };

    Ok(builder.build())
}

fn map_smtp_error(error: &lettre::transport::smtp::Error) -> DeliveryError {
    let message = error.to_string();
    if error.is_permanent() {
        DeliveryError::Rejected(format!("permanent SMTP error: {message}"))
    } else {
        DeliveryError::Transport(format!("SMTP error: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SmtpConfig {
        SmtpConfig {
            smtp_host: "localhost".to_string(),
            smtp_port: 2525,
            username: None,
            password: None,
            tls: false,
            from_address: "noreply@blackraven.test".to_string(),
        }
    }

    fn request<'a>(recipient: &'a str) -> DeliveryRequest<'a> {
        DeliveryRequest {
            transfer_id: "t-1",
            platform: "email",
            recipient,
            sender: "owner@example.com",
            filename: "will.pdf",
            media_type: "application/pdf",
            payload: &[0u8; 1536],
            message: Some("open when ready"),
            access_url: Some("https://blackraven.test/shared/t-1"),
        }
    }

    #[test]
    fn body_mentions_message_size_and_link() {
        let body = render_text_body(&request("heir@example.com"));
        assert!(body.starts_with("owner@example.com has shared files"));
        assert!(body.contains("Message: open when ready"));
        assert!(body.contains("- will.pdf (1.5 KB)"));
        assert!(body.contains("https://blackraven.test/shared/t-1"));
    }

    #[test]
    fn builds_message_with_attachment() {
        let from = parse_from("noreply@blackraven.test").expect("from");
        let message = build_message(&from, &request("heir@example.com")).expect("message");
        let raw = String::from_utf8(message.formatted()).expect("utf8");
        assert!(raw.contains("Subject: owner@example.com has shared files with you via BlackRaven"));
        assert!(raw.contains("will.pdf"));
    }

    #[test]
    fn html_body_escapes_owner_text() {
        let mut req = request("heir@example.com");
        req.message = Some("<script>alert('x')</script> & more");
        let html = render_html_body(&req);
        assert!(html.contains("&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt; &amp; more"));
        assert!(html.contains("<li>will.pdf (1.5 KB)</li>"));
        assert!(html.contains("href=\"https://blackraven.test/shared/t-1\""));
    }

    #[test]
    fn message_carries_text_and_html_alternatives() {
        let from = parse_from("noreply@blackraven.test").expect("from");
        let message = build_message(&from, &request("heir@example.com")).expect("message");
        let raw = String::from_utf8(message.formatted()).expect("utf8");
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/html"));
        assert!(raw.contains("text/plain"));
    }

    #[test]
    fn smtp_reference_joins_reply_lines() {
        assert_eq!(
            smtp_reference(250, ["2.0.0 Ok: queued as 4F1C2"].into_iter()),
            "250 2.0.0 Ok: queued as 4F1C2"
        );
        assert_eq!(smtp_reference(250, std::iter::empty()), "250");
    }

    #[test]
    fn rejects_unparseable_recipient() {
        let from = parse_from("noreply@blackraven.test").expect("from");
        let err = build_message(&from, &request("not-an-email")).unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidRecipient(_)));
    }

    #[test]
    fn rejects_bad_from_address() {
        let mut cfg = config();
        cfg.from_address = "nope".to_string();
        assert!(matches!(
            EmailDelivery::new(cfg),
            Err(DeliveryError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn builds_plain_transport() {
        let delivery = EmailDelivery::new(config()).expect("delivery");
        assert_eq!(delivery.mechanism_name(), "smtp");
    }
}
