use std::time::Duration;

use anyhow::Result;

use super::ClientOptions;

/// Frames still queued are given this long to reach the relay before closing.
const FLUSH_GRACE: Duration = Duration::from_millis(200);

/// Append `text` and return the resulting document text.
pub(crate) async fn append_text(options: &ClientOptions, document: &str, text: &str) -> Result<String> {
    let collab = options.collaboration();
    let (session, synced) = options.open(&collab, document).await?;

    let doc = session.doc();
    doc.insert(doc.len(), text)?;
    if synced {
        tokio::time::sleep(FLUSH_GRACE).await;
    }
    let result = doc.text();
    collab.close_all().await;
    Ok(result)
}

pub async fn append(options: &ClientOptions, document: &str, text: &str) -> Result<()> {
    let result = append_text(options, document, text).await?;
    println!(
        "Appended {} chars to {document} ({} total)",
        text.chars().count(),
        result.chars().count()
    );
    Ok(())
}
