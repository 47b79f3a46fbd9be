use std::io;

use clap::{CommandFactory, Parser};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use tavern_chat::cli::{parse_input, render_event, Cli, Command, ConnectArgs, Input, HELP};
use tavern_chat::client::{AutoConnector, ChatClient, ClientError};
use tavern_chat::server;

const DEFAULT_LOG_FILTER: &str = "tavern_chat=info";

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Command::Serve(args) => {
            let config = args.resolve()?;
            server::serve(config).await?;
        }
        Command::Connect(args) => run_terminal_client(args).await?,
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "tavern-chat", &mut io::stdout());
        }
    }

    Ok(())
}

async fn run_terminal_client(args: ConnectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let options = args.client_options()?;
    let connector = AutoConnector::from_url(&args.url)?;
    let client = ChatClient::start(connector, options);

    client.subscribe(|event| {
        if let Some(line) = render_event(event) {
            println!("{line}");
        }
    });

    eprintln!("{}", format!("  Connecting to {}", args.url).bright_blue());
    eprintln!("{}", "  Type /help for commands.".bright_blue());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match parse_input(&line) {
            Input::Empty => Ok(()),
            Input::Say(text) => client.send(&text),
            Input::Nick(name) => client.change_username(&name),
            Input::Msg { to, text } => client.send_private(&to, &text),
            Input::Report(id) => client.report(&id),
            Input::Block(id) => client.block(&id),
            Input::Unblock(id) => client.unblock(&id),
            Input::Reports => client.request_reports(),
            Input::Reconnect => client.reconnect(),
            Input::Help => {
                println!("{HELP}");
                Ok(())
            }
            Input::Quit => break,
            Input::Invalid(msg) => {
                println!("{}", msg.yellow());
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(ClientError::NotConnected { state }) => {
                println!("{}", format!("! not connected ({state}); try /reconnect").bright_red());
            }
            Err(e) => println!("{}", format!("! {e}").bright_red()),
        }
    }

    client.shutdown();
    Ok(())
}
