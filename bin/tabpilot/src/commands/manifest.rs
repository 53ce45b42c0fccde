use tabpilot_agent::find_activation_rule;
use tabpilot_core::{Agent, Config, Paths};
use tabpilot_protocol::{build_http_client, AgentClient};

pub async fn run(url: &str, add: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths)?;
    let http = build_http_client(config.http.proxy.as_deref(), config.http.timeout());

    let agent = AgentClient::fetch_manifest(&http, url).await?;
    print_agent(&agent);

    if add {
        if config.agents.iter().any(|u| u == url) {
            println!();
            println!("Already registered in {}", paths.config_file().display());
        } else {
            config.agents.push(url.to_string());
            config.save(&paths.config_file())?;
            println!();
            println!("Registered in {}", paths.config_file().display());
        }
    }
    Ok(())
}

fn print_agent(agent: &Agent) {
    let manifest = &agent.manifest;
    println!("{} ({})", manifest.name, manifest.id);
    println!("==========");
    println!("URL:      {}", agent.url);
    println!("Logo:     {}", agent.logo);
    println!("Contact:  {}", manifest.contact_email);
    println!(
        "Auth:     {}",
        manifest.auth.as_ref().map_or("none".to_string(), |a| a.url.clone())
    );
    match manifest.poll_interval_seconds {
        Some(secs) => println!("Polling:  every {}s", secs),
        None => println!("Polling:  off"),
    }
    println!(
        "Close:    {}",
        manifest
            .on_session_close
            .as_ref()
            .map_or("none".to_string(), |a| a.http_request.url.clone())
    );
    println!("Rules:    {}", manifest.on_http_request.len());
    match find_activation_rule(agent) {
        Some(rule) => println!("Activate: {}", rule.condition.url_regex),
        None => println!("Activate: never (no activate action)"),
    }

    if let Some(prompts) = manifest.prompts.as_ref().filter(|p| !p.is_empty()) {
        println!();
        println!("Prompts:");
        for prompt in prompts {
            println!("  {:<16} {}", prompt.name, prompt.text);
        }
    }

    if !manifest.welcome_message.is_empty() {
        println!();
        println!("{}", manifest.welcome_message);
    }
}
