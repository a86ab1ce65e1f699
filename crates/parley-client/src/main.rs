use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use parley_client::{ClientConfig, DefaultClient};
use parley_types::events::RealtimeEvent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Also loads .env if present
    let config = ClientConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .init();

    let client = DefaultClient::from_config(&config)?;

    let profile = match (std::env::var("PARLEY_LOGIN"), std::env::var("PARLEY_PASSWORD")) {
        (Ok(login), Ok(password)) => client.sign_in(&login, &password).await?,
        _ => client
            .resume()
            .await
            .context("no stored session; set PARLEY_LOGIN and PARLEY_PASSWORD")?,
    };
    info!("Tailing as {} ({})", profile.username, profile.id);

    client.refresh_listings().await?;
    let unread = client.read(|sync| sync.total_unread())?;
    info!("{} unread message(s)", unread);

    let mut updates = client.subscribe();
    client.connect(config.channel()).await?;

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Skipped {} event(s)", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

fn log_event(event: &RealtimeEvent) {
    match event {
        RealtimeEvent::MessageReceived(message) => info!(
            "{} -> {}: {}",
            message.sender,
            message.receiver,
            message.content.preview()
        ),
        RealtimeEvent::MessageDeleted { message_id } => info!("Deleted {}", message_id),
        RealtimeEvent::MessageRead { message_id, .. } => info!("Read {}", message_id),
        RealtimeEvent::AllMessagesRead { reader, .. } => info!("{} read everything", reader),
        RealtimeEvent::TypingStarted { user_id, username } => info!(
            "{} is typing",
            username.as_deref().unwrap_or(user_id.as_str())
        ),
        RealtimeEvent::TypingStopped { user_id } => info!("{} stopped typing", user_id),
        RealtimeEvent::UserOnline { user_id } => info!("{} is online", user_id),
        RealtimeEvent::UserOffline { user_id } => info!("{} went offline", user_id),
        RealtimeEvent::OnlineUsers(users) => info!("{} user(s) online", users.len()),
    }
}
