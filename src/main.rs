use anyhow::{bail, Context, Result};
use clap::Parser;
use courier::cli::{App, Cli, Commands};
use courier::messages::{DeliveryStatus, Direction};
use courier::network::{Event, LinkState, Messenger};
use courier::storage::ImportSummary;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let app = App::new()?;

    match &cli.command {
        Commands::Send { recipient, message } => {
            let (username, password) = credentials(&cli)?;
            run_send(&app, &username, &password, recipient, message).await?;
        }
        Commands::Watch => {
            let (username, password) = credentials(&cli)?;
            run_watch(&app, &username, &password).await?;
        }
        Commands::Contacts => {
            let user = local_user(&app, &cli)?;
            let contacts = app.database.contact_list(user.user_id)?;
            if contacts.is_empty() {
                println!("No contacts yet. They are recorded automatically from messages.");
            }
            for contact in contacts {
                println!("{}", contact.peer);
            }
        }
        Commands::History {
            peer,
            limit,
            remote,
        } => {
            if *remote {
                let (username, password) = credentials(&cli)?;
                run_remote_history(&app, &username, &password, peer, *limit).await?;
            } else {
                let user = local_user(&app, &cli)?;
                let messages = app.database.get_messages(user.user_id, Some(peer), *limit)?;
                if messages.is_empty() {
                    println!("No messages with {peer} yet.");
                }
                for message in messages {
                    if message.sender == user.username {
                        println!("You: {}", message.body);
                    } else {
                        println!("{}: {}", message.sender, message.body);
                    }
                }
            }
        }
        Commands::Outbox { retry } => {
            let user = local_user(&app, &cli)?;
            if let Some(outbox_id) = retry {
                app.database.outbox_reset(*outbox_id)?;
                println!("Entry #{outbox_id} re-queued; it will be sent on the next run.");
                return Ok(());
            }
            let pending = app.database.outbox_list_pending(user.user_id)?;
            let failed = app.database.outbox_list_failed(user.user_id)?;
            if pending.is_empty() && failed.is_empty() {
                println!("Outbox is empty.");
            }
            for entry in pending.iter().chain(failed.iter()) {
                println!(
                    "#{} [{}] to {} ({} attempts): {}",
                    entry.outbox_id,
                    entry.delivery_status().as_str(),
                    entry.recipient,
                    entry.attempts,
                    entry.body
                );
            }
        }
        Commands::Import { path } => {
            let ImportSummary {
                username,
                contacts,
                messages,
                skipped,
                ..
            } = app.database.import_legacy_profile(path)?;
            println!(
                "Imported profile for {username}: {contacts} contacts, {messages} messages{}",
                if skipped > 0 {
                    format!(" ({skipped} unreadable entries skipped)")
                } else {
                    String::new()
                }
            );
        }
        Commands::Config => {
            if let Ok(path) = courier::cli::Config::default_config_file() {
                println!("# {}", path.display());
            }
            print!("{}", toml::to_string_pretty(&app.config)?);
        }
    }

    Ok(())
}

/// Queue one message and wait briefly for a delivery report. Queued-offline
/// is a success: the durable outbox guarantees later delivery.
async fn run_send(
    app: &App,
    username: &str,
    password: &str,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let options = app.config.messenger_options(username, password);
    let messenger = Messenger::start(options, app.database.clone()).await?;

    let entry = messenger.send(recipient, message).await?;
    info!(outbox_id = entry.outbox_id, recipient, "message queued");

    let mut outcome = None;
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = messenger.next_event() => match event {
                Some(Event::Delivery { outbox_id, status, attempts, .. })
                    if outbox_id == entry.outbox_id =>
                {
                    outcome = Some((status, attempts));
                    break;
                }
                Some(_) => continue,
                None => break,
            },
            _ = &mut deadline => break,
        }
    }

    match outcome {
        Some((DeliveryStatus::Confirmed, _)) => println!("✓ delivered to {recipient}"),
        Some((DeliveryStatus::Failed, attempts)) => println!(
            "✗ undeliverable after {attempts} attempts; kept in outbox as #{}",
            entry.outbox_id
        ),
        _ => println!(
            "queued as #{}; it will be delivered when the server is reachable",
            entry.outbox_id
        ),
    }

    messenger.shutdown().await;
    Ok(())
}

/// Fetch the server-side history and print one conversation from it.
async fn run_remote_history(
    app: &App,
    username: &str,
    password: &str,
    peer: &str,
    limit: u32,
) -> Result<()> {
    let options = app.config.messenger_options(username, password);
    let messenger = Messenger::start(options, app.database.clone()).await?;

    let mut state_rx = messenger.watch_connection();
    let connected = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if *state_rx.borrow_and_update() == LinkState::Connected {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok();
    if !connected {
        messenger.shutdown().await;
        bail!("could not reach the server");
    }

    let entries = messenger.fetch_all().await?;
    let mut shown = 0u32;
    for entry in &entries {
        if entry.direction.peer() != peer || shown >= limit {
            continue;
        }
        match &entry.direction {
            Direction::Received { sender } => println!("{sender}: {}", entry.body),
            Direction::Sent { .. } => println!("You: {}", entry.body),
        }
        shown += 1;
    }
    if shown == 0 {
        println!("No messages with {peer} on the server.");
    }

    messenger.shutdown().await;
    Ok(())
}

/// Interactive loop: print incoming messages, delivery reports and
/// connection-state changes until Ctrl-C.
async fn run_watch(app: &App, username: &str, password: &str) -> Result<()> {
    let options = app.config.messenger_options(username, password);
    let messenger = Messenger::start(options, app.database.clone()).await?;
    let mut state_rx = messenger.watch_connection();
    println!("connection: {}", messenger.connection_state().as_str());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; shutting down");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("connection: {}", state_rx.borrow().as_str());
            }
            event = messenger.next_event() => match event {
                Some(event) => print_event(&event),
                None => break,
            }
        }
    }

    messenger.shutdown().await;
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::Received(message) => {
            println!("{}: {}", message.sender, message.body);
        }
        Event::Delivery {
            outbox_id,
            recipient,
            status: DeliveryStatus::Confirmed,
            ..
        } => {
            println!("✓ delivered to {recipient} (#{outbox_id})");
        }
        Event::Delivery {
            outbox_id,
            recipient,
            status: DeliveryStatus::Failed,
            attempts,
        } => {
            println!("✗ undeliverable to {recipient} after {attempts} attempts (#{outbox_id} kept in outbox)");
        }
        Event::Delivery { .. } => {}
    }
}

/// Username and password for commands that talk to the server.
fn credentials(cli: &Cli) -> Result<(String, String)> {
    let username = cli
        .username
        .clone()
        .context("--username is required for this command")?;
    if !courier::auth::is_valid_identity(&username) {
        bail!("invalid username {username:?}");
    }
    let password = cli
        .password
        .clone()
        .context("--password is required for this command")?;
    Ok((username, password))
}

/// The local account row for commands that only read the database.
fn local_user(app: &App, cli: &Cli) -> Result<courier::storage::User> {
    let username = cli
        .username
        .clone()
        .context("--username is required for this command")?;
    app.database
        .get_user(&username)
        .context("unknown local user; send or receive a message first")
}
