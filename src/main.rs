#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::struct_excessive_bools,
    clippy::cast_possible_wrap,
    clippy::uninlined_format_args
)]

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use wacli::app::{App, BackfillOptions, Options, SyncMode, SyncOptions};
use wacli::config::{Config, DEFAULT_IDLE_EXIT};
use wacli::errors::{Error, Result};
use wacli::lock::StoreLock;
use wacli::out::{self, fmt_ts, truncate, Table};
use wacli::store::{ListMessagesParams, SearchMessagesParams};
use wacli::wa::{parse_user_or_jid, Jid, ParticipantAction};

/// `wacli` - mirror a WhatsApp Web account into a local, queryable store.
#[derive(Parser, Debug)]
#[command(name = "wacli")]
#[command(version)]
#[command(about = "WhatsApp Web session manager with a local message mirror", long_about = None)]
struct Cli {
    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Store directory (default: ~/.wacli, or $WACLI_STORE_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    store_dir: Option<String>,

    /// Per-command timeout in seconds (ignored by `sync --follow`)
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync messages (requires prior pairing; never shows QR)
    Sync {
        /// Sync until idle, then exit
        #[arg(long)]
        once: bool,

        /// Keep syncing until Ctrl+C (default)
        #[arg(long)]
        follow: bool,

        /// Exit after this many seconds of silence (once mode)
        #[arg(long, value_name = "SECS", default_value_t = DEFAULT_IDLE_EXIT.as_secs())]
        idle_exit: u64,

        /// Download media in the background during sync
        #[arg(long)]
        download_media: bool,

        /// Refresh contacts into the local DB before syncing
        #[arg(long)]
        refresh_contacts: bool,

        /// Refresh joined groups (live) into the local DB before syncing
        #[arg(long)]
        refresh_groups: bool,
    },

    /// Read and search stored messages
    Messages {
        #[command(subcommand)]
        command: MessagesCommands,
    },

    /// List chats from the local DB
    Chats {
        #[command(subcommand)]
        command: ChatsCommands,
    },

    /// Search and manage local contact metadata
    Contacts {
        #[command(subcommand)]
        command: ContactsCommands,
    },

    /// Group management
    Groups {
        #[command(subcommand)]
        command: GroupsCommands,
    },

    /// Media download
    Media {
        #[command(subcommand)]
        command: MediaCommands,
    },

    /// Pull older history for one chat on demand
    Backfill {
        /// Chat JID
        #[arg(long)]
        chat: String,

        /// Messages requested per hop
        #[arg(long, default_value_t = 50)]
        count: usize,

        /// Maximum request/response hops
        #[arg(long, default_value_t = 1)]
        requests: usize,

        /// Seconds to wait for each response
        #[arg(long, value_name = "SECS", default_value_t = 30)]
        wait_per_request: u64,

        /// Give up after this many seconds without progress
        #[arg(long, value_name = "SECS", default_value_t = 60)]
        idle_exit: u64,
    },

    /// Diagnostics for store, lock, auth and search
    Doctor {
        /// Also try connecting to WhatsApp (takes the store lock)
        #[arg(long)]
        connect: bool,
    },
}

#[derive(Subcommand, Debug)]
enum MessagesCommands {
    /// List messages, newest first
    List {
        #[arg(long, value_name = "JID")]
        chat: Option<String>,
        /// Only messages after this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_name = "TIME")]
        after: Option<String>,
        /// Only messages before this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_name = "TIME")]
        before: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Full-text search over stored messages
    Search {
        query: String,
        #[arg(long, value_name = "JID")]
        chat: Option<String>,
        /// Only messages from this sender JID
        #[arg(long, value_name = "JID")]
        from: Option<String>,
        /// Media type filter (image, video, audio, document, sticker)
        #[arg(long, value_name = "KIND")]
        r#type: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one message
    Show {
        #[arg(long, value_name = "JID")]
        chat: String,
        #[arg(long)]
        id: String,
    },
    /// Show a message with surrounding context
    Context {
        #[arg(long, value_name = "JID")]
        chat: String,
        #[arg(long)]
        id: String,
        /// Older messages to include
        #[arg(long, default_value_t = 5)]
        before: usize,
        /// Newer messages to include
        #[arg(long, default_value_t = 5)]
        after: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ChatsCommands {
    /// List chats
    List {
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one chat
    Show {
        #[arg(long, value_name = "JID")]
        jid: String,
    },
}

#[derive(Subcommand, Debug)]
enum ContactsCommands {
    /// Search contacts (from synced metadata)
    Search {
        query: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one contact
    Show {
        #[arg(long, value_name = "JID")]
        jid: String,
    },
    /// Import contacts from the session into the local DB
    Refresh,
    /// Manage local aliases
    Alias {
        #[command(subcommand)]
        command: AliasCommands,
    },
    /// Manage local tags
    Tags {
        #[command(subcommand)]
        command: TagsCommands,
    },
}

#[derive(Subcommand, Debug)]
enum AliasCommands {
    /// Set alias
    Set {
        #[arg(long, value_name = "JID")]
        jid: String,
        #[arg(long)]
        alias: String,
    },
    /// Remove alias
    Rm {
        #[arg(long, value_name = "JID")]
        jid: String,
    },
}

#[derive(Subcommand, Debug)]
enum TagsCommands {
    /// Add tag
    Add {
        #[arg(long, value_name = "JID")]
        jid: String,
        #[arg(long)]
        tag: String,
    },
    /// Remove tag
    Rm {
        #[arg(long, value_name = "JID")]
        jid: String,
        #[arg(long)]
        tag: String,
    },
}

#[derive(Subcommand, Debug)]
enum GroupsCommands {
    /// List known groups (from local DB; run sync to populate)
    List {
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Fetch joined groups (live) and update the local DB
    Refresh,
    /// Fetch group info (live) and update the local DB
    Info {
        #[arg(long, value_name = "JID")]
        jid: String,
    },
    /// Rename group
    Rename {
        #[arg(long, value_name = "JID")]
        jid: String,
        #[arg(long)]
        name: String,
    },
    /// Leave a group
    Leave {
        #[arg(long, value_name = "JID")]
        jid: String,
    },
    /// Manage group participants
    Participants {
        #[command(subcommand)]
        command: ParticipantsCommands,
    },
    /// Manage group invite links
    Invite {
        #[command(subcommand)]
        command: InviteCommands,
    },
    /// Join group by invite code
    Join {
        #[arg(long)]
        code: String,
    },
}

#[derive(Subcommand, Debug)]
enum ParticipantsCommands {
    /// Add participants
    Add(ParticipantsArgs),
    /// Remove participants
    Remove(ParticipantsArgs),
    /// Promote participants to admin
    Promote(ParticipantsArgs),
    /// Demote participants from admin
    Demote(ParticipantsArgs),
}

#[derive(clap::Args, Debug)]
struct ParticipantsArgs {
    #[arg(long, value_name = "JID")]
    jid: String,
    /// User phone number or JID (repeatable)
    #[arg(long, value_name = "USER")]
    user: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum InviteCommands {
    /// Get or revoke invite links
    Link {
        #[command(subcommand)]
        command: InviteLinkCommands,
    },
}

#[derive(Subcommand, Debug)]
enum InviteLinkCommands {
    /// Get invite link
    Get {
        #[arg(long, value_name = "JID")]
        jid: String,
    },
    /// Revoke and reissue the invite link
    Revoke {
        #[arg(long, value_name = "JID")]
        jid: String,
    },
}

#[derive(Subcommand, Debug)]
enum MediaCommands {
    /// Download media for a message
    Download {
        #[arg(long, value_name = "JID")]
        chat: String,
        #[arg(long)]
        id: String,
        /// Output file or directory (default: store media dir)
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli).await {
        eprintln!("wacli: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::resolve(cli.store_dir.as_deref(), cli.timeout);
    let json = cli.json;

    // `sync --follow` is the one deliberately unbounded command.
    let unbounded = matches!(cli.command, Commands::Sync { once: false, .. });
    let fut = dispatch(cli.command, config.clone(), json);
    if unbounded {
        fut.await
    } else {
        match tokio::time::timeout(config.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::transient(format!(
                "command exceeded the {}s timeout",
                config.timeout.as_secs()
            ))),
        }
    }
}

async fn dispatch(command: Commands, config: Config, json: bool) -> Result<()> {
    match command {
        Commands::Sync {
            once,
            follow: _,
            idle_exit,
            download_media,
            refresh_contacts,
            refresh_groups,
        } => {
            // Follow is the default; --once overrides it.
            let mode = if once { SyncMode::Once } else { SyncMode::Follow };
            let lock = StoreLock::acquire(config.store_dir())?;
            let app = open_app_with_wa(&config).await?;

            let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(());
                }
            });

            let res = app
                .sync(
                    SyncOptions {
                        mode,
                        download_media,
                        refresh_contacts,
                        refresh_groups,
                        idle_exit: Duration::from_secs(idle_exit),
                    },
                    shutdown_rx,
                )
                .await;
            app.close().await;
            lock.release()?;
            let summary = res?;

            let mut stdout = std::io::stdout();
            if json {
                out::write_json(
                    &mut stdout,
                    &serde_json::json!({
                        "synced": true,
                        "messages_stored": summary.messages_stored,
                    }),
                )?;
            } else {
                writeln!(stdout, "Messages stored: {}", summary.messages_stored)?;
            }
            Ok(())
        }

        Commands::Messages { command } => messages_cmd(command, &config, json),
        Commands::Chats { command } => chats_cmd(command, &config, json),
        Commands::Contacts { command } => contacts_cmd(command, &config, json).await,
        Commands::Groups { command } => groups_cmd(command, &config, json).await,

        Commands::Media { command } => match command {
            MediaCommands::Download { chat, id, output } => {
                let lock = StoreLock::acquire(config.store_dir())?;
                let app = open_app_with_wa(&config).await?;
                app.ensure_authed()?;
                app.connect(true, false).await?;
                let res = app.download_media(&chat, &id, output.as_deref()).await;
                app.close().await;
                lock.release()?;
                let dl = res?;

                let mut stdout = std::io::stdout();
                if json {
                    out::write_json(
                        &mut stdout,
                        &serde_json::json!({
                            "chat": dl.chat_jid,
                            "id": dl.msg_id,
                            "path": dl.path,
                            "bytes": dl.bytes,
                            "media_type": dl.media_type,
                            "mime_type": dl.mime_type,
                            "downloaded": true,
                            "downloaded_at": Utc::now().to_rfc3339(),
                        }),
                    )?;
                } else {
                    writeln!(stdout, "{} ({} bytes)", dl.path.display(), dl.bytes)?;
                }
                Ok(())
            }
        },

        Commands::Backfill {
            chat,
            count,
            requests,
            wait_per_request,
            idle_exit,
        } => {
            let lock = StoreLock::acquire(config.store_dir())?;
            let app = open_app_with_wa(&config).await?;
            app.ensure_authed()?;
            let res = app
                .backfill_history(BackfillOptions {
                    chat_jid: chat,
                    count,
                    requests,
                    wait_per_request: Duration::from_secs(wait_per_request),
                    idle_exit: Duration::from_secs(idle_exit),
                })
                .await;
            app.close().await;
            lock.release()?;
            let summary = res?;

            let mut stdout = std::io::stdout();
            if json {
                out::write_json(&mut stdout, &summary)?;
            } else {
                writeln!(
                    stdout,
                    "Requests: {}  Added: {}  Reached end: {}",
                    summary.requests_sent, summary.messages_added, summary.reached_end
                )?;
            }
            Ok(())
        }

        Commands::Doctor { connect } => {
            let report = wacli::doctor::run(&config, connect).await?;
            wacli::doctor::render(&mut std::io::stdout(), &report, json)
        }
    }
}

// ── Messages ─────────────────────────────────────────────────────

fn messages_cmd(command: MessagesCommands, config: &Config, json: bool) -> Result<()> {
    let app = open_app(config)?;
    let mut stdout = std::io::stdout();

    match command {
        MessagesCommands::List {
            chat,
            after,
            before,
            limit,
        } => {
            let msgs = app.store().list_messages(&ListMessagesParams {
                chat_jid: chat.unwrap_or_default(),
                after: after.as_deref().map(parse_time).transpose()?,
                before: before.as_deref().map(parse_time).transpose()?,
                limit,
            })?;
            if json {
                return out::write_json(&mut stdout, &msgs);
            }
            render_message_table(&mut stdout, &msgs)
        }

        MessagesCommands::Search {
            query,
            chat,
            from,
            r#type,
            limit,
        } => {
            let msgs = app.store().search_messages(&SearchMessagesParams {
                query,
                chat_jid: chat.unwrap_or_default(),
                from: from.unwrap_or_default(),
                media_type: r#type.unwrap_or_default(),
                before: None,
                after: None,
                limit,
            })?;
            if json {
                return out::write_json(&mut stdout, &msgs);
            }
            render_message_table(&mut stdout, &msgs)
        }

        MessagesCommands::Show { chat, id } => {
            let msg = app.store().get_message(&chat, &id)?;
            if json {
                return out::write_json(&mut stdout, &msg);
            }
            writeln!(stdout, "Chat: {}", msg.chat_jid)?;
            writeln!(stdout, "ID: {}", msg.msg_id)?;
            writeln!(stdout, "From: {}", sender_label(&msg.sender_jid, msg.from_me))?;
            writeln!(
                stdout,
                "Time: {}",
                msg.timestamp.map(|t| fmt_ts(t.timestamp())).unwrap_or_default()
            )?;
            if !msg.media_type.is_empty() {
                writeln!(stdout, "Media: {}", msg.media_type)?;
            }
            if !msg.text.is_empty() {
                writeln!(stdout, "Text: {}", msg.text)?;
            } else if !msg.display_text.is_empty() {
                writeln!(stdout, "Text: {}", msg.display_text)?;
            }
            Ok(())
        }

        MessagesCommands::Context {
            chat,
            id,
            before,
            after,
        } => {
            let msgs = app.store().message_context(&chat, &id, before, after)?;
            if json {
                return out::write_json(&mut stdout, &msgs);
            }
            render_message_table(&mut stdout, &msgs)
        }
    }
}

fn render_message_table<W: std::io::Write>(w: &mut W, msgs: &[wacli::store::Message]) -> Result<()> {
    let mut table = Table::new(&["TIME", "CHAT", "FROM", "TEXT"]);
    for m in msgs {
        let chat = if m.chat_name.is_empty() {
            m.chat_jid.clone()
        } else {
            m.chat_name.clone()
        };
        let text = if m.snippet.is_empty() {
            &m.display_text
        } else {
            &m.snippet
        };
        table.row(&[
            m.timestamp.map(|t| fmt_ts(t.timestamp())).unwrap_or_default(),
            truncate(&chat, 24),
            truncate(&sender_label(&m.sender_jid, m.from_me), 20),
            truncate(text, 60),
        ]);
    }
    table.flush(w)
}

fn sender_label(sender_jid: &str, from_me: bool) -> String {
    if from_me {
        "me".to_string()
    } else {
        sender_jid.to_string()
    }
}

// ── Chats ────────────────────────────────────────────────────────

fn chats_cmd(command: ChatsCommands, config: &Config, json: bool) -> Result<()> {
    let app = open_app(config)?;
    let mut stdout = std::io::stdout();

    match command {
        ChatsCommands::List { query, limit } => {
            let chats = app.store().list_chats(query.as_deref().unwrap_or(""), limit)?;
            if json {
                return out::write_json(&mut stdout, &chats);
            }
            let mut table = Table::new(&["KIND", "NAME", "JID", "LAST"]);
            for c in &chats {
                let name = if c.name.is_empty() { &c.jid } else { &c.name };
                table.row(&[
                    c.kind.clone(),
                    truncate(name, 28),
                    c.jid.clone(),
                    c.last_message_ts
                        .map(|t| fmt_ts(t.timestamp()))
                        .unwrap_or_default(),
                ]);
            }
            table.flush(&mut stdout)
        }

        ChatsCommands::Show { jid } => {
            let c = app.store().get_chat(&jid)?;
            if json {
                return out::write_json(&mut stdout, &c);
            }
            writeln!(stdout, "JID: {}", c.jid)?;
            writeln!(stdout, "Kind: {}", c.kind)?;
            writeln!(stdout, "Name: {}", c.name)?;
            writeln!(
                stdout,
                "Last: {}",
                c.last_message_ts
                    .map(|t| fmt_ts(t.timestamp()))
                    .unwrap_or_default()
            )?;
            Ok(())
        }
    }
}

// ── Contacts ─────────────────────────────────────────────────────

async fn contacts_cmd(command: ContactsCommands, config: &Config, json: bool) -> Result<()> {
    let mut stdout = std::io::stdout();

    match command {
        ContactsCommands::Search { query, limit } => {
            let app = open_app(config)?;
            let contacts = app.store().search_contacts(&query, limit)?;
            if json {
                return out::write_json(&mut stdout, &contacts);
            }
            let mut table = Table::new(&["ALIAS", "NAME", "PHONE", "JID"]);
            for c in &contacts {
                table.row(&[
                    truncate(&c.alias, 18),
                    truncate(&c.name, 24),
                    truncate(&c.phone, 14),
                    c.jid.clone(),
                ]);
            }
            table.flush(&mut stdout)
        }

        ContactsCommands::Show { jid } => {
            let app = open_app(config)?;
            let c = app.store().get_contact(&jid)?;
            if json {
                return out::write_json(&mut stdout, &c);
            }
            writeln!(stdout, "JID: {}", c.jid)?;
            if !c.phone.is_empty() {
                writeln!(stdout, "Phone: {}", c.phone)?;
            }
            if !c.name.is_empty() {
                writeln!(stdout, "Name: {}", c.name)?;
            }
            if !c.alias.is_empty() {
                writeln!(stdout, "Alias: {}", c.alias)?;
            }
            if !c.tags.is_empty() {
                writeln!(stdout, "Tags: {}", c.tags.join(", "))?;
            }
            Ok(())
        }

        ContactsCommands::Refresh => {
            let lock = StoreLock::acquire(config.store_dir())?;
            let app = open_app_with_wa(config).await?;
            app.ensure_authed()?;
            app.connect(true, false).await?;
            let res = app.refresh_contacts().await;
            app.close().await;
            lock.release()?;
            let count = res?;

            if json {
                out::write_json(&mut stdout, &serde_json::json!({ "contacts": count }))?;
            } else {
                writeln!(stdout, "Imported {count} contacts.")?;
            }
            Ok(())
        }

        ContactsCommands::Alias { command } => {
            let lock = StoreLock::acquire(config.store_dir())?;
            let app = open_app(config)?;
            match command {
                AliasCommands::Set { jid, alias } => {
                    app.store().set_alias(&jid, &alias)?;
                    lock.release()?;
                    if json {
                        out::write_json(
                            &mut stdout,
                            &serde_json::json!({ "jid": jid, "alias": alias }),
                        )?;
                    } else {
                        writeln!(stdout, "OK")?;
                    }
                }
                AliasCommands::Rm { jid } => {
                    app.store().remove_alias(&jid)?;
                    lock.release()?;
                    if json {
                        out::write_json(
                            &mut stdout,
                            &serde_json::json!({ "jid": jid, "removed": true }),
                        )?;
                    } else {
                        writeln!(stdout, "OK")?;
                    }
                }
            }
            Ok(())
        }

        ContactsCommands::Tags { command } => {
            let lock = StoreLock::acquire(config.store_dir())?;
            let app = open_app(config)?;
            match command {
                TagsCommands::Add { jid, tag } => {
                    app.store().add_tag(&jid, &tag)?;
                    lock.release()?;
                    if json {
                        out::write_json(&mut stdout, &serde_json::json!({ "jid": jid, "tag": tag }))?;
                    } else {
                        writeln!(stdout, "OK")?;
                    }
                }
                TagsCommands::Rm { jid, tag } => {
                    app.store().remove_tag(&jid, &tag)?;
                    lock.release()?;
                    if json {
                        out::write_json(
                            &mut stdout,
                            &serde_json::json!({ "jid": jid, "tag": tag, "removed": true }),
                        )?;
                    } else {
                        writeln!(stdout, "OK")?;
                    }
                }
            }
            Ok(())
        }
    }
}

// ── Groups ───────────────────────────────────────────────────────

async fn groups_cmd(command: GroupsCommands, config: &Config, json: bool) -> Result<()> {
    let mut stdout = std::io::stdout();

    match command {
        GroupsCommands::List { query, limit } => {
            let app = open_app(config)?;
            let groups = app.store().list_groups(query.as_deref().unwrap_or(""), limit)?;
            if json {
                return out::write_json(&mut stdout, &groups);
            }
            let mut table = Table::new(&["NAME", "JID", "CREATED"]);
            for g in &groups {
                let name = if g.name.is_empty() { &g.jid } else { &g.name };
                table.row(&[
                    truncate(name, 40),
                    g.jid.clone(),
                    g.created_at.map(|t| fmt_ts(t.timestamp())).unwrap_or_default(),
                ]);
            }
            table.flush(&mut stdout)
        }

        GroupsCommands::Refresh => {
            let (app, lock) = connected_app(config).await?;
            let res = app.refresh_groups().await;
            app.close().await;
            lock.release()?;
            let count = res?;
            if json {
                out::write_json(&mut stdout, &serde_json::json!({ "groups": count }))?;
            } else {
                writeln!(stdout, "Imported {count} groups.")?;
            }
            Ok(())
        }

        GroupsCommands::Info { jid } => {
            let gjid: Jid = jid.parse()?;
            let (app, lock) = connected_app(config).await?;
            let res = async {
                let info = app.wa()?.get_group_info(&gjid).await?;
                app.persist_group(&info)?;
                Ok::<_, Error>(info)
            }
            .await;
            app.close().await;
            lock.release()?;
            let info = res?;

            if json {
                return out::write_json(&mut stdout, &info);
            }
            writeln!(stdout, "JID: {}", info.jid)?;
            writeln!(stdout, "Name: {}", info.name)?;
            writeln!(stdout, "Owner: {}", info.owner_jid)?;
            writeln!(
                stdout,
                "Created: {}",
                info.created_at.map(|t| fmt_ts(t.timestamp())).unwrap_or_default()
            )?;
            writeln!(stdout, "Participants: {}", info.participants.len())?;
            Ok(())
        }

        GroupsCommands::Rename { jid, name } => {
            if name.trim().is_empty() {
                return Err(Error::invalid("--name is required"));
            }
            let gjid: Jid = jid.parse()?;
            let (app, lock) = connected_app(config).await?;
            let res = async {
                let wa = app.wa()?;
                wa.set_group_name(&gjid, &name).await?;
                if let Ok(info) = wa.get_group_info(&gjid).await {
                    app.persist_group(&info)?;
                }
                Ok::<_, Error>(())
            }
            .await;
            app.close().await;
            lock.release()?;
            res?;
            if json {
                out::write_json(&mut stdout, &serde_json::json!({ "jid": jid, "name": name }))?;
            } else {
                writeln!(stdout, "OK")?;
            }
            Ok(())
        }

        GroupsCommands::Leave { jid } => {
            let gjid: Jid = jid.parse()?;
            let (app, lock) = connected_app(config).await?;
            let res = async { app.wa()?.leave_group(&gjid).await }.await;
            app.close().await;
            lock.release()?;
            res?;
            if json {
                out::write_json(&mut stdout, &serde_json::json!({ "jid": jid, "left": true }))?;
            } else {
                writeln!(stdout, "OK")?;
            }
            Ok(())
        }

        GroupsCommands::Participants { command } => {
            let (action, args) = match command {
                ParticipantsCommands::Add(args) => (ParticipantAction::Add, args),
                ParticipantsCommands::Remove(args) => (ParticipantAction::Remove, args),
                ParticipantsCommands::Promote(args) => (ParticipantAction::Promote, args),
                ParticipantsCommands::Demote(args) => (ParticipantAction::Demote, args),
            };
            if args.user.is_empty() {
                return Err(Error::invalid("at least one --user is required"));
            }
            let gjid: Jid = args.jid.parse()?;
            let users = args
                .user
                .iter()
                .map(|u| parse_user_or_jid(u))
                .collect::<Result<Vec<_>>>()?;

            let (app, lock) = connected_app(config).await?;
            let res = async {
                let wa = app.wa()?;
                let updated = wa.update_group_participants(&gjid, &users, action).await?;
                if let Ok(info) = wa.get_group_info(&gjid).await {
                    app.persist_group(&info)?;
                }
                Ok::<_, Error>(updated)
            }
            .await;
            app.close().await;
            lock.release()?;
            let updated = res?;

            if json {
                out::write_json(&mut stdout, &updated)?;
            } else {
                writeln!(stdout, "OK")?;
            }
            Ok(())
        }

        GroupsCommands::Invite { command } => {
            let InviteCommands::Link { command } = command;
            let (jid, revoke) = match command {
                InviteLinkCommands::Get { jid } => (jid, false),
                InviteLinkCommands::Revoke { jid } => (jid, true),
            };
            let gjid: Jid = jid.parse()?;
            let (app, lock) = connected_app(config).await?;
            let res = async { app.wa()?.get_group_invite_link(&gjid, revoke).await }.await;
            app.close().await;
            lock.release()?;
            let link = res?;

            if json {
                out::write_json(
                    &mut stdout,
                    &serde_json::json!({ "jid": jid, "link": link, "revoked": revoke }),
                )?;
            } else {
                writeln!(stdout, "{link}")?;
            }
            Ok(())
        }

        GroupsCommands::Join { code } => {
            if code.trim().is_empty() {
                return Err(Error::invalid("--code is required"));
            }
            let (app, lock) = connected_app(config).await?;
            let res = async {
                let wa = app.wa()?;
                let jid = wa.join_group_with_link(&code).await?;
                if let Ok(info) = wa.get_group_info(&jid).await {
                    app.persist_group(&info)?;
                }
                Ok::<_, Error>(jid)
            }
            .await;
            app.close().await;
            lock.release()?;
            let jid = res?;

            if json {
                out::write_json(
                    &mut stdout,
                    &serde_json::json!({ "jid": jid.to_string(), "joined": true }),
                )?;
            } else {
                writeln!(stdout, "Joined: {jid}")?;
            }
            Ok(())
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// Read-only app: store only, no lock, no protocol client.
fn open_app(config: &Config) -> Result<App> {
    App::open(Options {
        config: config.clone(),
    })
}

async fn open_app_with_wa(config: &Config) -> Result<Arc<App>> {
    let app = Arc::new(App::open(Options {
        config: config.clone(),
    })?);
    app.open_wa().await?;
    Ok(app)
}

/// Locked, authed, connected app for live (network) commands.
async fn connected_app(config: &Config) -> Result<(Arc<App>, StoreLock)> {
    let lock = StoreLock::acquire(config.store_dir())?;
    let app = open_app_with_wa(config).await?;
    app.ensure_authed()?;
    app.connect(true, false).await?;
    Ok((app, lock))
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DD` (midnight UTC).
fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid("time is required"));
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t.and_utc());
        }
    }
    Err(Error::invalid(format!(
        "unsupported time format {trimmed:?} (use RFC 3339 or YYYY-MM-DD)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_time_accepts_both_formats() {
        assert_eq!(
            parse_time("2024-03-01").unwrap(),
            DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z").unwrap()
        );
        assert!(parse_time("2024-03-01T10:30:00+02:00").is_ok());
        assert!(parse_time("yesterday").is_err());
        assert!(parse_time("  ").is_err());
    }

    #[test]
    fn cli_parses_representative_commands() {
        Cli::try_parse_from(["wacli", "sync", "--once", "--download-media"]).unwrap();
        Cli::try_parse_from(["wacli", "--json", "messages", "search", "hello", "--limit", "5"])
            .unwrap();
        Cli::try_parse_from(["wacli", "chats", "list", "--query", "alice"]).unwrap();
        Cli::try_parse_from([
            "wacli", "groups", "participants", "add", "--jid", "1@g.us", "--user", "1555",
        ])
        .unwrap();
        Cli::try_parse_from(["wacli", "media", "download", "--chat", "1@s.whatsapp.net", "--id", "m"])
            .unwrap();
        Cli::try_parse_from(["wacli", "doctor", "--connect"]).unwrap();
        assert!(Cli::try_parse_from(["wacli", "messages", "show"]).is_err());
    }

    #[test]
    fn sender_label_collapses_self() {
        assert_eq!(sender_label("1@s.whatsapp.net", true), "me");
        assert_eq!(sender_label("1@s.whatsapp.net", false), "1@s.whatsapp.net");
    }
}
