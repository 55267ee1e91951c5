//! Listen command - connect and print events as they arrive.

use std::sync::Arc;

use clap::Args;
use console::style;
use tracing::{info, warn};

use msgr_api::{ApiClient, Credentials};
use msgr_core::config::ConfigHandle;
use msgr_core::error::{MsgrError, MsgrResult};
use msgr_socket::{DomainEvent, EventKind, LifecycleEvent, ListenerBuilder, ListenerEvent};

use crate::OutputFormat;

#[derive(Args)]
pub struct ListenArgs {
    /// Raw `Cookie` header of a logged-in session (must contain `c_user`).
    #[arg(long)]
    pub cookie: String,

    /// Page token scraped at login.
    #[arg(long)]
    pub fb_dtsg: Option<String>,

    /// Comma-separated event kinds to print (default: all).
    #[arg(long, value_delimiter = ',')]
    pub kinds: Vec<String>,

    /// Also print messages sent by this account.
    #[arg(long)]
    pub self_listen: bool,

    /// Do not reconnect after failures.
    #[arg(long)]
    pub no_reconnect: bool,
}

fn parse_kinds(names: &[String]) -> MsgrResult<Vec<EventKind>> {
    names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(|name| {
            EventKind::from_str(name)
                .ok_or_else(|| MsgrError::Config(format!("unknown event kind: {name}")))
        })
        .collect()
}

pub async fn run(config: ConfigHandle, args: ListenArgs, format: OutputFormat) -> MsgrResult<()> {
    let kinds = parse_kinds(&args.kinds)?;
    let cfg = config.read().await.clone();

    let mut credentials = Credentials::from_cookie_header(&args.cookie, &cfg.http.base_url)?;
    if let Some(token) = args.fb_dtsg {
        credentials = credentials.with_fb_dtsg(token);
    }

    let mut listen = cfg.listen.clone();
    listen.self_listen |= args.self_listen;
    if args.no_reconnect {
        listen.auto_reconnect = false;
    }

    let api = ApiClient::new(&cfg.http, &credentials, &cfg.transport.user_agent)?;
    let mut listener = ListenerBuilder::new(credentials, Arc::new(api))
        .with_config(listen)
        .with_transport_config(cfg.transport.clone())
        .subscribe(&kinds)
        .start()?;
    let mut events = listener
        .take_subscription()
        .ok_or_else(|| MsgrError::Internal("listener has no initial subscription".into()))?;

    if format == OutputFormat::Text {
        println!("{} Listening (Ctrl-C to stop)...", style("[msgr]").bold().dim());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("event stream closed");
                    break;
                };
                print_event(&event, format)?;
                if matches!(event, ListenerEvent::Lifecycle(LifecycleEvent::Fatal(_))) {
                    listener.stop().await;
                    return Err(MsgrError::ListenerStopped);
                }
            }
        }
    }

    listener.stop().await;
    if format == OutputFormat::Text {
        println!("{} Stopped.", style("[msgr]").bold().dim());
    }
    Ok(())
}

fn print_event(event: &ListenerEvent, format: OutputFormat) -> MsgrResult<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let now = chrono::Local::now().format("%H:%M:%S");
    let label = style(format!("{:<16}", event.kind())).cyan();
    match event {
        ListenerEvent::Lifecycle(lifecycle) => match lifecycle {
            LifecycleEvent::Connected | LifecycleEvent::Ready => {
                println!("{now} {}", style(event.kind()).green().bold());
            }
            LifecycleEvent::Reconnecting { attempt } => println!("{now} {label} attempt {attempt}"),
            LifecycleEvent::Disconnected { reason, will_retry } => {
                println!("{now} {label} {reason} (retry: {will_retry})");
            }
            LifecycleEvent::Closed => println!("{now} {label}"),
            LifecycleEvent::Error { detail } => {
                println!("{now} {} {detail}", style(format!("{:<16}", "error")).yellow());
            }
            LifecycleEvent::Fatal(fatal) => println!(
                "{now} {} {:?} {}: {}",
                style(format!("{:<16}", "fatal")).red().bold(),
                fatal.kind,
                fatal.reason,
                fatal.error
            ),
        },
        ListenerEvent::Domain(domain) => match domain {
            DomainEvent::Message(m) => {
                println!("{now} {label} [{}] {}: {}", m.thread_id, m.sender_id, m.body);
            }
            DomainEvent::MessageReply(r) => println!(
                "{now} {label} [{}] {}: {} (reply to {})",
                r.message.thread_id,
                r.message.sender_id,
                r.message.body,
                r.replied_to.as_ref().map_or("?", |m| m.message_id.as_str())
            ),
            DomainEvent::MessageReaction(r) => println!(
                "{now} {label} [{}] {} {} on {}",
                r.thread_id,
                r.user_id,
                r.reaction.as_deref().unwrap_or("(removed)"),
                r.message_id
            ),
            DomainEvent::MessageUnsend(u) => {
                println!("{now} {label} [{}] {} unsent {}", u.thread_id, u.sender_id, u.message_id);
            }
            DomainEvent::Typing(t) => {
                println!("{now} {label} [{}] {} typing={}", t.thread_id, t.from, t.is_typing);
            }
            DomainEvent::Presence(p) => println!("{now} {label} {} @ {}", p.user_id, p.timestamp),
            DomainEvent::ReadReceipt(r) => println!("{now} {label} [{}] read by {}", r.thread_id, r.reader),
            DomainEvent::ThreadLog(l) => {
                println!("{now} {label} [{}] {} by {}", l.thread_id, l.log_message_type, l.author);
            }
            DomainEvent::FriendRequestReceived(f) | DomainEvent::FriendRequestCancel(f) => {
                println!("{now} {label} from {}", f.actor_id);
            }
        },
    }
    Ok(())
}
