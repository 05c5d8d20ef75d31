/// Terminal client for the sync engine: watch the notification feed, tail
/// a conversation, list threads, mark notifications read.
use colored::*;
use leadwire_core::events::SyncEvent;
use leadwire_core::types::{Delivery, Severity, TimelineEntry};
use leadwire_core::{Config, SyncSession};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

pub async fn run(config: Config, command: Vec<String>) -> anyhow::Result<()> {
    if command.is_empty() {
        print_usage();
        return Ok(());
    }

    let session = SyncSession::new(config)?;

    match command[0].as_str() {
        "watch" => watch(&session).await?,
        "threads" => threads(&session).await?,
        "thread" => {
            if command.len() < 3 {
                eprintln!("{}", "Usage: thread <lead_id> <counterparty_id>".yellow());
                return Ok(());
            }
            let lead_id = command[1].parse::<i64>()?;
            let counterparty_id = command[2].parse::<i64>()?;
            tail_thread(&session, lead_id, counterparty_id).await?;
        }
        "notifications" => notifications(&session).await?,
        "read" => {
            if command.len() < 2 {
                eprintln!("{}", "Usage: read <notification_id>".yellow());
                return Ok(());
            }
            let id = command[1].parse::<i64>()?;
            session.mark_notification_read(id).await?;
            println!("{} notification {} marked read", "✓".green(), id);
        }
        other => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), other.red());
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("{}", "Leadwire sync client".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  leadwire <api_base> <command> [args] [--token <t>] [--user <id>]");
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!(
        "  {}                         Stream notifications and cues",
        "watch".cyan()
    );
    println!(
        "  {}                       List conversation threads",
        "threads".cyan()
    );
    println!(
        "  {} <lead_id> <peer_id>   Tail a conversation; stdin lines send",
        "thread".cyan()
    );
    println!(
        "  {}                 List notifications",
        "notifications".cyan()
    );
    println!(
        "  {} <id>                   Mark a notification read",
        "read".cyan()
    );
}

fn severity_marker(severity: Severity) -> ColoredString {
    match severity {
        Severity::Critical => "!".red().bold(),
        Severity::Warning => "~".yellow(),
        Severity::Info => "·".cyan(),
    }
}

/// Stream the notification feed until Ctrl+C
async fn watch(session: &SyncSession) -> anyhow::Result<()> {
    let mut events = session.subscribe();
    let feed = session.start_notifications();

    println!("{}", "Watching notifications (Ctrl+C to stop)".bright_white());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::Toast { id, title, message, severity }) => {
                    println!(
                        "{} [{}] {} — {}",
                        severity_marker(severity),
                        id,
                        title.bright_white().bold(),
                        message
                    );
                    println!("  {} unread", feed.unread_count().await);
                }
                Ok(SyncEvent::ChannelStateChanged { state }) => {
                    println!("{} channel {:?}", "⇅".blue(), state);
                }
                Ok(SyncEvent::ChannelLost { reason }) => {
                    eprintln!("{} push channel lost: {}", "✗".red().bold(), reason);
                    break;
                }
                Ok(SyncEvent::AuthExpired) => {
                    eprintln!("{}", "✗ session expired, sign in again".red().bold());
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    feed.close();
    Ok(())
}

async fn threads(session: &SyncSession) -> anyhow::Result<()> {
    let summaries = session.thread_summaries().await?;
    if summaries.is_empty() {
        println!("No threads yet");
        return Ok(());
    }
    for s in summaries {
        let badge = if s.unread_count > 0 {
            format!(" ({})", s.unread_count).bright_red().bold().to_string()
        } else {
            String::new()
        };
        println!(
            "{} lead {} ↔ user {}{}  {}",
            s.last_timestamp.format("%H:%M"),
            s.lead_id.to_string().cyan(),
            s.counterparty_id,
            badge,
            s.last_preview.dimmed()
        );
    }
    Ok(())
}

fn print_entry(entry: &TimelineEntry, current_user: i64) {
    let who = if entry.sender_id == current_user {
        "me".green()
    } else {
        format!("user {}", entry.sender_id).cyan()
    };
    let flag = match entry.delivery {
        Delivery::Pending => " …".dimmed().to_string(),
        Delivery::Failed => " ✗ failed (retry manually)".red().to_string(),
        Delivery::Confirmed => String::new(),
    };
    println!(
        "{} {}: {}{}",
        entry.created_at.format("%H:%M:%S"),
        who,
        entry.body,
        flag
    );
}

/// Tail a conversation; lines typed on stdin are sent into the thread
async fn tail_thread(
    session: &SyncSession,
    lead_id: i64,
    counterparty_id: i64,
) -> anyhow::Result<()> {
    let me = session.config().current_user;
    let mut events = session.subscribe();
    let view = session.open_thread(lead_id, counterparty_id);

    // Let the initial load land before rendering
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let mut shown = 0;
    for entry in view.timeline().await {
        print_entry(&entry, me);
        shown += 1;
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = view.send(line.trim().to_string()).await {
                        eprintln!("{} send failed: {}", "✗".red(), e);
                    }
                    let timeline = view.timeline().await;
                    for entry in timeline.iter().skip(shown) {
                        print_entry(entry, me);
                    }
                    shown = timeline.len();
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            },
            event = events.recv() => match event {
                Ok(SyncEvent::MessageReceived { thread }) if thread == view.key() => {
                    let timeline = view.timeline().await;
                    for entry in timeline.iter().skip(shown) {
                        print_entry(entry, me);
                    }
                    shown = timeline.len();
                }
                Ok(SyncEvent::AuthExpired) => {
                    eprintln!("{}", "✗ session expired, sign in again".red().bold());
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    view.close();
    Ok(())
}

async fn notifications(session: &SyncSession) -> anyhow::Result<()> {
    let list = session.fetch_notifications().await?;
    if list.is_empty() {
        println!("No notifications");
        return Ok(());
    }
    for n in list {
        let read = if n.read { " ".normal() } else { "●".bright_red() };
        println!(
            "{} {} [{}] {} — {}",
            read,
            severity_marker(n.severity),
            n.id,
            n.title.bright_white(),
            n.message.dimmed()
        );
    }
    Ok(())
}
