use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use relaychat_core::codec::{encode_npub, encode_nsec, parse_keys, parse_public_key};
use relaychat_core::nostr_sdk::{EventId, Keys, PublicKey};
use relaychat_core::{Conversation, DecryptedMessage, Direction, KeyStore, Profile, Session};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::config::Config;
use crate::keystore::{FileKeyStore, Passphrase};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a new keypair and store it encrypted
    Keygen {
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },
    /// Import an existing secret key (nsec1... or hex)
    Import {
        secret: String,
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },
    /// Show the stored identity
    Whoami,
    /// Remove the stored key and relay list
    Logout,
    /// Manage relays
    Relays {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// List conversations, newest first
    Conversations {
        /// Keep printing updates for this many seconds
        #[arg(long)]
        watch: Option<u64>,
    },
    /// Open a conversation: prints the thread and sends each stdin line
    Chat {
        /// Counterparty (npub1... or hex)
        counterparty: String,
    },
    /// Send one message
    Send {
        /// Counterparty (npub1... or hex)
        counterparty: String,
        text: String,
    },
    /// Show or publish profile metadata
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum RelayAction {
    List,
    Add { url: String },
    Remove { url: String },
}

#[derive(Subcommand, Debug)]
pub enum ProfileAction {
    /// Show a profile (default: your own)
    Show { npub: Option<String> },
    /// Publish your profile
    Set {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        picture: Option<String>,
        #[arg(long)]
        about: Option<String>,
    },
}

pub async fn handle_command(cmd: Commands, config: Config) -> Result<()> {
    match cmd {
        Commands::Keygen { force } => cmd_keygen(&config, force),
        Commands::Import { secret, force } => cmd_import(&secret, &config, force),
        Commands::Whoami => cmd_whoami(&config),
        Commands::Logout => cmd_logout(config),
        Commands::Relays { action } => cmd_relays(action, config),
        Commands::Conversations { watch } => cmd_conversations(&config, watch).await,
        Commands::Chat { counterparty } => cmd_chat(&config, &counterparty).await,
        Commands::Send { counterparty, text } => cmd_send(&config, &counterparty, &text).await,
        Commands::Profile { action } => cmd_profile(&config, action).await,
    }
}

fn key_store(config: &Config) -> FileKeyStore {
    FileKeyStore::new(config.key_file(), Passphrase::Interactive)
}

fn open_session(config: &Config) -> Result<Session> {
    let store = key_store(config);
    if !store.exists() {
        bail!("No identity stored. Run `relaychat keygen` or `relaychat import <nsec>` first.");
    }
    Session::from_stores(&store, config, config.pool_config()).context("Failed to unlock identity")
}

fn store_keys(config: &Config, keys: &Keys, force: bool) -> Result<()> {
    let store = key_store(config);
    if store.exists() && !force {
        bail!(
            "An identity is already stored at {} (use --force to replace it)",
            store.path().display()
        );
    }
    store.save_private_key(keys).context("Failed to store key")?;
    Ok(())
}

fn cmd_keygen(config: &Config, force: bool) -> Result<()> {
    let keys = Keys::generate();
    store_keys(config, &keys, force)?;

    println!("🔑 New keypair generated:\n");
    println!("  npub: {}", encode_npub(&keys.public_key())?);
    println!("  nsec: {}", encode_nsec(&keys)?);
    println!();
    println!("Keep the nsec somewhere safe; it is stored encrypted at {}", config.key_file().display());
    Ok(())
}

fn cmd_import(secret: &str, config: &Config, force: bool) -> Result<()> {
    let keys = parse_keys(secret).context("Invalid secret key")?;
    store_keys(config, &keys, force)?;

    println!("✅ Imported identity:\n");
    println!("  npub: {}", encode_npub(&keys.public_key())?);
    println!("  hex:  {}", keys.public_key().to_hex());
    Ok(())
}

fn cmd_whoami(config: &Config) -> Result<()> {
    match key_store(config).stored_public_key()? {
        Some(hex) => {
            let public_key = PublicKey::from_hex(&hex).context("Key file holds an invalid public key")?;
            println!("🔑 Identity:\n");
            println!("  npub: {}", encode_npub(&public_key)?);
            println!("  hex:  {hex}");
        }
        None => {
            println!("No identity stored.");
            println!("Run `relaychat keygen` or `relaychat import <nsec>` to set one up.");
        }
    }
    Ok(())
}

fn cmd_logout(mut config: Config) -> Result<()> {
    key_store(&config).clear_private_key()?;
    config.clear_relays();
    config.save()?;
    println!("👋 Identity and relay list removed.");
    Ok(())
}

fn cmd_relays(action: RelayAction, mut config: Config) -> Result<()> {
    match action {
        RelayAction::List => {
            println!("📡 Configured relays:\n");
            for relay in &config.relays {
                println!("  {relay}");
            }
        }
        RelayAction::Add { url } => {
            let url = config.add_relay(&url)?;
            config.save()?;
            println!("✅ Added {url}");
        }
        RelayAction::Remove { url } => {
            config.remove_relay(&url)?;
            config.save()?;
            println!("✅ Removed {url}");
        }
    }
    Ok(())
}

/// Wait until the list has been quiet for a moment, bounded by the replay
/// timeout.
async fn settle(rx: &mut watch::Receiver<Vec<Conversation>>, limit: Duration) {
    let quiet = Duration::from_millis(1500);
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return;
        }
        match tokio::time::timeout(quiet.min(deadline - now), rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) | Err(_) => return,
        }
    }
}

fn print_conversations(list: &[Conversation]) {
    if list.is_empty() {
        println!("No conversations yet.");
        return;
    }
    println!("💬 Conversations:\n");
    for conversation in list {
        let when = if conversation.latest_message_at == 0 {
            "-".to_string()
        } else {
            format_time(conversation.latest_message_at)
        };
        let npub = encode_npub(&conversation.counterparty).unwrap_or_else(|_| conversation.counterparty.to_hex());
        println!("  {when}  {}  {npub}", conversation.display_name);
    }
}

async fn cmd_conversations(config: &Config, watch_secs: Option<u64>) -> Result<()> {
    let session = open_session(config)?;
    let mut rx = session.conversations();
    let limit = config.pool_config().eose_timeout + Duration::from_secs(2);
    settle(&mut rx, limit).await;
    print_conversations(&rx.borrow_and_update());

    if let Some(secs) = watch_secs {
        let until = tokio::time::sleep(Duration::from_secs(secs));
        tokio::pin!(until);
        loop {
            tokio::select! {
                _ = &mut until => break,
                _ = tokio::signal::ctrl_c() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    println!();
                    print_conversations(&rx.borrow_and_update());
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn format_time(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_message(message: &DecryptedMessage, name: &str) {
    let who = match message.direction {
        Direction::Sent => "you",
        Direction::Received => name,
    };
    println!("[{}] {who}: {}", format_time(message.created_at), message.plaintext);
}

/// Print messages not shown yet. Older ones that arrive late are printed
/// as they come; the thread itself stays ordered.
fn print_new(messages: &[DecryptedMessage], shown: &mut HashSet<EventId>, name: &str) {
    for message in messages {
        if shown.insert(message.id) {
            print_message(message, name);
        }
    }
}

async fn cmd_chat(config: &Config, counterparty: &str) -> Result<()> {
    let session = open_session(config)?;
    let conversation = session.start_conversation(counterparty).await?;
    let mut name = conversation.display_name.clone();
    if let Ok(Some(profile)) = session.profile(&conversation.counterparty).await {
        if let Some(display) = profile.display_name() {
            name = display.to_string();
        }
    }

    let thread = session.open_thread(conversation.counterparty);
    let mut updates = thread.updates();
    let mut shown = HashSet::new();
    println!("💬 Chat with {name}. Type a message and press enter; /older loads history, /quit exits.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let messages = updates.borrow_and_update().clone();
                print_new(&messages, &mut shown, &name);
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let line = line.trim();
                match line {
                    "" => {}
                    "/quit" => break,
                    "/older" => {
                        let added = thread.load_older().await?;
                        if added == 0 {
                            println!("(no older messages)");
                        } else {
                            // Reprint in order so history reads top to bottom.
                            println!("--- {added} older message(s) ---");
                            for message in thread.messages() {
                                shown.insert(message.id);
                                print_message(&message, &name);
                            }
                        }
                    }
                    text => {
                        if let Err(e) = thread.send(text).await {
                            println!("⚠ not delivered: {e}");
                        }
                    }
                }
            }
        }
    }

    drop(thread);
    session.shutdown().await;
    Ok(())
}

async fn cmd_send(config: &Config, counterparty: &str, text: &str) -> Result<()> {
    let recipient = parse_public_key(counterparty)?;
    let session = open_session(config)?;
    let result = session.send_message(&recipient, text).await;
    session.shutdown().await;

    let output = result.context("Message was not accepted by any relay")?;
    println!("✅ Sent (event {}, accepted by {})", output.event_id, output.accepted_by);
    Ok(())
}

async fn cmd_profile(config: &Config, action: ProfileAction) -> Result<()> {
    let session = open_session(config)?;
    let result = match action {
        ProfileAction::Show { npub } => show_profile(&session, npub.as_deref()).await,
        ProfileAction::Set { name, picture, about } => {
            let profile = Profile {
                name,
                picture,
                about,
                ..Profile::default()
            };
            session
                .publish_profile(&profile)
                .await
                .map(|output| {
                    println!("✅ Profile published (event {})", output.event_id);
                })
                .context("Profile was not accepted by any relay")
        }
    };
    session.shutdown().await;
    result
}

async fn show_profile(session: &Session, npub: Option<&str>) -> Result<()> {
    let author = match npub {
        Some(text) => parse_public_key(text)?,
        None => session.public_key(),
    };
    match session.profile(&author).await? {
        Some(profile) => {
            println!("👤 {}\n", encode_npub(&author)?);
            if let Some(name) = profile.display_name() {
                println!("  name:    {name}");
            }
            if let Some(about) = &profile.about {
                println!("  about:   {about}");
            }
            if let Some(picture) = &profile.picture {
                println!("  picture: {picture}");
            }
            if let Some(nip05) = &profile.nip05 {
                println!("  nip05:   {nip05}");
            }
        }
        None => println!("No profile found for {}", encode_npub(&author)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn parses_chat_and_send() {
        let cli = TestCli::try_parse_from(["relaychat", "send", "npub1abc", "hello there"]).unwrap();
        assert!(matches!(cli.command, Commands::Send { ref text, .. } if text == "hello there"));

        let cli = TestCli::try_parse_from(["relaychat", "conversations", "--watch", "30"]).unwrap();
        assert!(matches!(cli.command, Commands::Conversations { watch: Some(30) }));
    }

    #[test]
    fn parses_profile_set() {
        let cli = TestCli::try_parse_from(["relaychat", "profile", "set", "--name", "alice"]).unwrap();
        match cli.command {
            Commands::Profile {
                action: ProfileAction::Set { name, picture, about },
            } => {
                assert_eq!(name.as_deref(), Some("alice"));
                assert!(picture.is_none() && about.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn formats_unix_time() {
        assert!(format_time(0).starts_with("19"));
    }
}
