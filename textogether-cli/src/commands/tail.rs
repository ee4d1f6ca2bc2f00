use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;

use textogether_sync::{EditorBinding, PlainTextSurface};

use super::ClientOptions;

fn print_presence(binding: &EditorBinding<PlainTextSurface>) {
    let cursors = binding.surface().cursors();
    if cursors.is_empty() {
        println!("-- nobody else here");
        return;
    }
    for (client, cursor) in cursors {
        let at = cursor
            .range
            .map(|r| format!("{}..{}", r.start(), r.end()))
            .unwrap_or_else(|| "-".to_string());
        println!("-- {} ({}) {} at {at}", cursor.display_name, client, cursor.color);
    }
}

pub async fn tail(options: &ClientOptions, document: &str) -> Result<()> {
    let collab = options.collaboration();
    let (session, _) = options.open(&collab, document).await?;

    let mut binding = session.binding(PlainTextSurface::new());
    let mut changes = session.doc().subscribe_changes();
    let mut presence = session.awareness().subscribe();
    let mut state = session.bridge().watch_state();

    let mut label = session.bridge().state().label();
    println!("== {} [{label}]", session.id());
    println!("{}", binding.surface().text());
    print_presence(&binding);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if binding.pump() > 0 {
                        println!("== text");
                        println!("{}", binding.surface().text());
                    }
                }
                Err(RecvError::Closed) => break,
            },
            change = presence.recv() => match change {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    binding.pump();
                    print_presence(&binding);
                }
                Err(RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = state.borrow_and_update().label();
                if next != label {
                    label = next;
                    println!("== [{label}]");
                }
            }
        }
    }

    collab.close_all().await;
    Ok(())
}
