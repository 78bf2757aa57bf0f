use anyhow::Context;
use clap::Parser;
use complaintchat::{
    ChatSession, ComplaintId, Config, HttpComplaintApi,
    view::{render_html, render_text},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Terminal chat for one complaint.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Complaint whose chat to join
    complaint: String,

    /// Realtime server base URL (overrides CHAT_SOCKET_URL)
    #[arg(long)]
    socket_url: Option<String>,

    /// REST api base URL (overrides CHAT_API_URL)
    #[arg(long)]
    api_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("complaintchat=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(socket_url) = args.socket_url {
        config.socket_url = socket_url;
    }
    if let Some(api_url) = args.api_url {
        config.api_url = api_url;
    }

    let api = HttpComplaintApi::new(&config.api_url, config.token.clone());
    let mut session = ChatSession::new(config, api);
    session.mount(ComplaintId::new(args.complaint));
    print!("{}", render_text(&session.view()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let changed = tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "/quit" => break,
                    "/html" => {
                        println!("{}", render_html(&session.view()));
                        false
                    }
                    cmd if cmd.starts_with("/room ") => {
                        let id = cmd.trim_start_matches("/room ").trim();
                        session.switch_room(ComplaintId::new(id));
                        true
                    }
                    _ => {
                        session.set_input(line);
                        session.submit().is_some()
                    }
                }
            }
            changed = session.step() => changed,
        };

        for notice in session.take_notices() {
            eprintln!("! {}", notice.text());
        }
        if changed {
            print!("{}", render_text(&session.view()));
        }
    }

    session.unmount();
    info!("bye");
    Ok(())
}
