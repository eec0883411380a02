use crate::models::{RequestStatus, UploadRequest};

// Minimal server-rendered pages for the buyer-facing form. One page per
// lifecycle state, plus the generic degradation pages that never leak
// internal detail.

pub fn page_for(record: &UploadRequest, completed_at_local: &str, max_files: usize) -> String {
    match record.status {
        RequestStatus::Pending => upload_form_page(record, max_files),
        RequestStatus::Completed => completed_page(record, completed_at_local),
        RequestStatus::CompletedResetRequested => under_review_page(record),
    }
}

fn upload_form_page(record: &UploadRequest, max_files: usize) -> String {
    format!(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Upload your files</title>
  {STYLE}
</head>
<body>
  <main>
    <h1>Hi {buyer_name},</h1>
    <p>Upload the photos for order <strong>{order_reference}</strong> below (up to {max_files} files).</p>
    <form method="post" action="/upload" enctype="multipart/form-data">
      <input type="hidden" name="id" value="{id}"/>
      <input type="file" name="files" multiple required/>
      <button type="submit">Upload</button>
    </form>
  </main>
</body>
</html>"#,
        buyer_name = escape(&record.buyer_name),
        order_reference = escape(&record.order_reference),
        id = record.id,
    )
}

fn completed_page(record: &UploadRequest, completed_at_local: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Upload received</title>
  {STYLE}
</head>
<body>
  <main>
    <h1>All set!</h1>
    <p>We received your files for order <strong>{order_reference}</strong> on {completed_at}.</p>
    <p>Made a mistake? You can ask to redo the upload; the seller will confirm.</p>
    <button id="restart">Request a restart</button>
    <p id="result"></p>
  </main>
  <script>
    document.getElementById('restart').onclick = async () => {{
      const res = await fetch('/request-restart', {{
        method: 'POST',
        headers: {{ 'Content-Type': 'application/json' }},
        body: JSON.stringify({{ id: '{id}' }}),
      }});
      document.getElementById('result').textContent = res.ok
        ? 'Restart requested. The seller has been notified.'
        : 'Could not request a restart right now.';
    }};
  </script>
</body>
</html>"#,
        order_reference = escape(&record.order_reference),
        completed_at = escape(completed_at_local),
        id = record.id,
    )
}

fn under_review_page(record: &UploadRequest) -> String {
    format!(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Restart under review</title>
  {STYLE}
</head>
<body>
  <main>
    <h1>Restart under review</h1>
    <p>Your restart request for order <strong>{order_reference}</strong> is waiting for the seller.</p>
    <p>If it isn't confirmed within a few days it expires and your original upload stands.</p>
  </main>
</body>
</html>"#,
        order_reference = escape(&record.order_reference),
    )
}

pub fn invalid_link_page() -> String {
    format!(
        r#"<!doctype html>
<html>
<head><meta charset='utf-8'/><title>Invalid link</title>{STYLE}</head>
<body><main><h1>Invalid or expired link</h1>
<p>This upload link isn't valid. Please check the link from your email.</p></main></body>
</html>"#
    )
}

pub fn error_page() -> String {
    format!(
        r#"<!doctype html>
<html>
<head><meta charset='utf-8'/><title>Something went wrong</title>{STYLE}</head>
<body><main><h1>An error occurred</h1>
<p>Please try again in a moment.</p></main></body>
</html>"#
    )
}

const STYLE: &str = r#"<style>
    body { font-family: system-ui, sans-serif; margin: 0; background: #fafafa; }
    main { max-width: 32rem; margin: 4rem auto; padding: 2rem; background: #fff;
           border: 1px solid #ddd; border-radius: 8px; }
    button { padding: 0.5rem 1rem; }
  </style>"#;

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(status: RequestStatus) -> UploadRequest {
        let mut record = UploadRequest::new(
            "Jane <script>".to_string(),
            "jane@x.com".to_string(),
            "1001".to_string(),
            Utc::now(),
        );
        record.status = status;
        record
    }

    #[test]
    fn pending_state_renders_the_upload_form() {
        let record = record(RequestStatus::Pending);
        let html = page_for(&record, "", 10);
        assert!(html.contains("action=\"/upload\""));
        assert!(html.contains(&record.id.to_string()));
        // Buyer-supplied text is escaped.
        assert!(html.contains("Jane &lt;script&gt;"));
    }

    #[test]
    fn completed_state_offers_restart() {
        let record = record(RequestStatus::Completed);
        let html = page_for(&record, "2026-08-25 08:00 EDT", 10);
        assert!(html.contains("/request-restart"));
        assert!(html.contains("2026-08-25 08:00 EDT"));
    }

    #[test]
    fn reset_requested_state_shows_review_notice() {
        let record = record(RequestStatus::CompletedResetRequested);
        let html = page_for(&record, "", 10);
        assert!(html.contains("under review"));
        assert!(!html.contains("/upload\""));
    }
}
