use anyhow::{Context, Result};
use colored::Colorize;
use quickchat_application::{ChatSync, NoticeLevel};
use quickchat_core::participant::ParticipantProfile;
use quickchat_core::store::{DocumentStore, StoreLayout};
use quickchat_core::SyncSettings;
use quickchat_infrastructure::{InMemoryDocumentStore, InMemoryIdentityProvider, load_settings};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const PEOPLE: [(&str, &str, &str); 3] = [
    ("u1", "ann@example.com", "Ann"),
    ("u2", "bob@example.com", "Bob"),
    ("u3", "cat@example.com", "Cat"),
];

fn init_tracing(settings: &SyncSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    // A subscriber may already be installed when embedded; keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn seed(store: &InMemoryDocumentStore, settings: &SyncSettings) -> Result<()> {
    let layout = StoreLayout::new(settings);
    for (id, email, name) in PEOPLE {
        let profile = ParticipantProfile {
            id: id.to_string(),
            email: email.to_string(),
            display_name: name.to_string(),
        };
        store
            .merge(&layout.user(id), profile.to_document())
            .await
            .with_context(|| format!("Failed to seed profile {}", id))?;
    }
    Ok(())
}

async fn client(
    store: &Arc<InMemoryDocumentStore>,
    user: &str,
    settings: &SyncSettings,
) -> Result<ChatSync> {
    let identity = Arc::new(InMemoryIdentityProvider::signed_in(user));
    let mut sync = ChatSync::new(store.clone(), identity, settings.clone());
    sync.start()
        .await
        .with_context(|| format!("Failed to start sync for {}", user))?;
    sync.process_pending().await;
    Ok(sync)
}

fn render(who: &str, sync: &mut ChatSync) {
    println!("{}", format!("── {} ──", who).bright_cyan().bold());

    for conversation in sync.visible_conversations() {
        let marker = if sync.state().is_selected(&conversation.id) {
            "▶".green()
        } else {
            " ".normal()
        };
        let preview = if conversation.last_message.is_empty() {
            "(no messages yet)".dimmed().to_string()
        } else {
            conversation.last_message.clone()
        };
        println!(
            "{} {:<12} {}",
            marker,
            conversation.effective_display_name().bold(),
            preview
        );
    }

    if let Some(active) = &sync.state().active_conversation {
        println!("  {}", format!("# {}", active.effective_display_name()).yellow());
        for message in &sync.state().messages {
            let sender = if message.is_from(sync.state().user_id.as_deref().unwrap_or_default()) {
                "me".green()
            } else {
                message.sender.as_str().blue()
            };
            println!("    [{}] {}: {}", message.timestamp.as_datetime().format("%H:%M:%S"), sender, message.text);
        }
    }

    for notice in sync.take_notices() {
        let line = format!("  ! {}", notice.message);
        match notice.level {
            NoticeLevel::Info => println!("{}", line.dimmed()),
            NoticeLevel::Warning => println!("{}", line.yellow()),
            NoticeLevel::Error => println!("{}", line.red()),
        }
    }
    println!();
}

pub async fn run(config: Option<&Path>) -> Result<()> {
    let settings = load_settings(config).context("Failed to load settings")?;
    init_tracing(&settings);

    println!("{}", "💬 QuickChat demo (in-memory store)".bold());
    println!();

    let store = Arc::new(InMemoryDocumentStore::new());
    seed(&store, &settings).await?;

    let mut ann = client(&store, "u1", &settings).await?;
    let mut bob = client(&store, "u2", &settings).await?;

    let shared = ann
        .start_conversation_with("bob@example.com")
        .await
        .context("Ann could not start a conversation with Bob")?;
    bob.start_conversation_with("cat@example.com")
        .await
        .context("Bob could not start a conversation with Cat")?;
    ann.process_pending().await;
    bob.process_pending().await;

    bob.on_select_conversation(&shared).await?;
    bob.process_pending().await;
    render("Bob, before Ann writes", &mut bob);

    ann.set_input("hi");
    ann.send_input().await.context("Ann's message was not sent")?;
    bob.process_pending().await;
    render("Bob, after Ann says hi", &mut bob);

    bob.set_input("hey Ann!");
    bob.send_input().await.context("Bob's message was not sent")?;
    ann.set_input("   ");
    if let Err(e) = ann.send_input().await {
        tracing::info!("Blank message rejected: {}", e);
    }
    ann.process_pending().await;
    render("Ann", &mut ann);

    bob.on_search("ann");
    bob.process_pending().await;
    render("Bob, searching for \"ann\"", &mut bob);

    println!("{}", "✅ Demo finished".green());
    Ok(())
}
