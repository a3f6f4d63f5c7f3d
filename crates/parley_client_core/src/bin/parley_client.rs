#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_client_core::{
	ChatSession, ClientConfig, DEFAULT_SERVER_ENDPOINT, DeliveryStatus, HttpChatApi, PipelineCommand, SessionController,
	SseTransport,
};
use parley_domain::{ChatId, DirectPair, MessageId, UserId};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::warn;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_client [--connect http://host:port] [--open CHAT_ID]\n\
\n\
Options:\n\
	--connect   Server endpoint (alias: --endpoint) (default: http://127.0.0.1:18300)\n\
	            Format: http://host:port\n\
	--endpoint  Alias for --connect\n\
	--open      Chat to open on start\n\
	--help      Show this help\n\
\n\
Environment:\n\
	PARLEY_TOKEN  Session token (see `parley_server --issue-token USER`)\n\
\n\
Commands (stdin):\n\
	/open CHAT_ID      open a chat\n\
	/dm USER_ID        open the direct chat with USER_ID\n\
	/retry TEMP_ID     resend a failed message\n\
	/edit MSG_ID TEXT  edit one of your messages\n\
	/refresh           reload the chat list\n\
	/quit              exit\n\
	anything else      send to the open chat\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,parley_client_core=info".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	endpoint: String,
	open: Option<String>,
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT.to_string();
	let mut open = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--open" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				open = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	Args { endpoint, open }
}

/// Commands for one stdin line.
fn parse_line(line: &str, me: &UserId) -> Result<Vec<PipelineCommand>, String> {
	let line = line.trim();
	if line.is_empty() {
		return Ok(Vec::new());
	}
	let Some(rest) = line.strip_prefix('/') else {
		return Ok(vec![PipelineCommand::Send { text: line.to_string() }]);
	};

	let (cmd, arg) = rest.split_once(' ').unwrap_or((rest, ""));
	let arg = arg.trim();
	let cmds = match cmd {
		"open" => vec![PipelineCommand::Open {
			chat_id: ChatId::new(arg).map_err(|e| e.to_string())?,
		}],
		"dm" => {
			let other = UserId::new(arg).map_err(|e| e.to_string())?;
			vec![PipelineCommand::Open {
				chat_id: DirectPair::new(me.clone(), other).chat_id(),
			}]
		}
		"retry" => vec![PipelineCommand::Retry {
			temp_id: MessageId::new(arg).map_err(|e| e.to_string())?,
		}],
		"edit" => {
			let (id, text) = arg.split_once(' ').ok_or("usage: /edit MSG_ID TEXT")?;
			vec![
				PipelineCommand::BeginEdit {
					message_id: MessageId::new(id).map_err(|e| e.to_string())?,
				},
				PipelineCommand::SubmitEdit { text: text.to_string() },
			]
		}
		"refresh" => vec![PipelineCommand::Refresh],
		"quit" => vec![PipelineCommand::Shutdown],
		other => return Err(format!("unknown command: /{other}")),
	};
	Ok(cmds)
}

fn render(session: &ChatSession, last: &mut String) {
	let mut out = String::new();
	for (label, view) in [("direct", session.sidebar().direct_view()), ("groups", session.sidebar().group_view())] {
		out.push_str(&format!("[{label}]\n"));
		for e in view {
			let marker = if session.sidebar().active() == Some(&e.chat.id) { '*' } else { ' ' };
			let unseen = if e.unseen > 0 { format!(" ({})", e.unseen) } else { String::new() };
			out.push_str(&format!(" {marker} {} <{}>{unseen}\n", e.display_name, e.chat.id));
		}
	}
	if let Some(p) = session.active_pipeline() {
		out.push_str(&format!("[{}]\n", p.chat_id()));
		for r in p.records().iter().take(10).rev() {
			let status = match r.status {
				DeliveryStatus::Pending => " (sending)",
				DeliveryStatus::Failed => " (failed, /retry to resend)",
				DeliveryStatus::Sent => "",
			};
			out.push_str(&format!(
				"   {}: {}  [{}]{status}\n",
				r.message.sender_id, r.message.text, r.message.id
			));
		}
		if let Some(d) = p.draft() {
			out.push_str(&format!("   editing {}: {}", d.message_id, d.text));
			if let Some(err) = &d.error {
				out.push_str(&format!(" ({err})"));
			}
			out.push('\n');
		}
	}

	if *last != out {
		println!("{out}");
		*last = out;
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let token = std::env::var("PARLEY_TOKEN")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
		.ok_or_else(|| anyhow::anyhow!("PARLEY_TOKEN must be set"))?;

	let cfg = ClientConfig::from_http_endpoint(&args.endpoint, token).unwrap_or_else(|e| {
		eprintln!("Invalid --connect value: {}\n{e}", args.endpoint);
		usage_and_exit();
	});

	let api = Arc::new(HttpChatApi::new(&cfg)?);
	let transport = Arc::new(SseTransport::new(&cfg)?);
	let session = ChatSession::start(api, transport, &cfg).await?;
	let me = session.me().clone();

	let (cmd_tx, cmd_rx) = mpsc::channel(64);
	let controller = SessionController::new(cmd_tx);
	if let Some(chat) = args.open {
		controller.open(ChatId::new(chat)?).await?;
	}

	let input = {
		let controller = controller.clone();
		tokio::spawn(async move {
			let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
			while let Ok(Some(line)) = lines.next_line().await {
				let cmds = match parse_line(&line, &me) {
					Ok(cmds) => cmds,
					Err(e) => {
						warn!("{e}");
						continue;
					}
				};
				for cmd in cmds {
					if controller.command(cmd).await.is_err() {
						return;
					}
				}
			}
		})
	};

	let mut last = String::new();
	tokio::select! {
		_ = session.run(cmd_rx, move |s| render(s, &mut last)) => {}
		_ = tokio::signal::ctrl_c() => {
			let _ = controller.shutdown().await;
		}
	}
	input.abort();
	Ok(())
}
