use anyhow::Result;
use serde::Serialize;

use super::ClientOptions;

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub document: String,
    pub text: String,
    pub connected: bool,
    pub participants: Vec<String>,
}

pub(crate) async fn snapshot(options: &ClientOptions, document: &str) -> Result<Snapshot> {
    let collab = options.collaboration();
    let (session, synced) = options.open(&collab, document).await?;

    let mut participants: Vec<_> = session
        .awareness()
        .get_states()
        .into_values()
        .map(|state| state.display_name)
        .collect();
    participants.sort();

    let snapshot = Snapshot {
        document: session.id().to_string(),
        text: session.doc().text(),
        connected: synced,
        participants,
    };
    collab.close_all().await;
    Ok(snapshot)
}

pub async fn cat(options: &ClientOptions, document: &str, json: bool) -> Result<()> {
    let snapshot = snapshot(options, document).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", snapshot.text);
        if !snapshot.text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}
