use anyhow::Context;
use base64::Engine;
use std::path::Path;
use std::sync::Arc;
use tabpilot_agent::ActivationOutcome;
use tabpilot_core::{Attachment, Config, Paths, Prompt, TabId};
use tabpilot_protocol::{build_http_client, AgentClient};
use tabpilot_storage::JsonFileStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use super::host::{build_orchestrator, StdoutMessenger};

const TAB: TabId = 1;

#[derive(Debug, PartialEq)]
enum Input {
    Skip,
    Quit,
    Help,
    Text(String),
    Audio(String),
    Prompt(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Skip;
    }
    match line.split_once(' ') {
        Some(("/audio", path)) => Input::Audio(path.trim().to_string()),
        Some(("/prompt", name)) => Input::Prompt(name.trim().to_string()),
        _ => match line {
            "/quit" | "/exit" => Input::Quit,
            "/help" => Input::Help,
            _ => Input::Text(line.to_string()),
        },
    }
}

fn audio_mime(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        _ => "audio/webm",
    }
}

async fn read_audio(path: &str) -> anyhow::Result<Attachment> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path))?;
    Ok(Attachment {
        data: base64::engine::general_purpose::STANDARD.encode(bytes),
        mime: Some(audio_mime(Path::new(path)).to_string()),
    })
}

fn print_help(prompts: &[Prompt]) {
    println!("Type a message and press enter.");
    println!("  /audio <file>   send a recording");
    println!("  /prompt <name>  send one of the agent's prompts");
    println!("  /quit           close the session");
    for prompt in prompts {
        println!("  prompt {:<12} {}", prompt.name, prompt.text);
    }
}

pub async fn run(agent_url: &str, page: Option<&str>, token: Option<&str>) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;
    let config = Config::load_or_default(&paths)?;

    let http = build_http_client(config.http.proxy.as_deref(), config.http.timeout());
    let agent = AgentClient::fetch_manifest(&http, agent_url).await?;
    let prompts = agent.manifest.prompts.clone().unwrap_or_default();
    let page = page.unwrap_or(agent_url).to_string();

    let store = Arc::new(JsonFileStore::new(paths.state_file()));
    let orchestrator = build_orchestrator(
        config,
        store,
        vec![agent.clone()],
        StdoutMessenger::new(false),
        token,
    );

    // A previous run that was killed leaves its session behind.
    if let Some(stale) = orchestrator.session(TAB).await? {
        warn!(session_id = %stale.id, agent = %stale.agent.name(), "Closing session left by a previous run");
        orchestrator.close(TAB).await?;
    }

    orchestrator.set_listener_active(TAB, true).await?;
    match orchestrator.activate(agent, TAB, &page).await? {
        ActivationOutcome::Activated(_) | ActivationOutcome::AlreadyActive => {}
        ActivationOutcome::Failed => {
            orchestrator.shutdown().await;
            return Ok(());
        }
    }
    println!();
    print_help(&prompts);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let sent = match parse_input(&line) {
            Input::Skip => continue,
            Input::Quit => break,
            Input::Help => {
                print_help(&prompts);
                continue;
            }
            Input::Text(text) => orchestrator.handle_user_message(TAB, &text, None).await,
            Input::Audio(path) => match read_audio(&path).await {
                Ok(file) => orchestrator.handle_user_message(TAB, "", Some(file)).await,
                Err(e) => {
                    eprintln!("{:#}", e);
                    continue;
                }
            },
            Input::Prompt(name) => match prompts.iter().find(|p| p.name == name) {
                Some(prompt) => orchestrator.handle_user_message(TAB, &prompt.text, None).await,
                None => {
                    eprintln!("No prompt named '{}'", name);
                    continue;
                }
            },
        };
        if let Err(e) = sent {
            warn!(error = %e, "Message not delivered");
        }
    }

    orchestrator.close(TAB).await?;
    orchestrator.shutdown().await;
    Ok(())
}
