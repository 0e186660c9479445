use std::{path::Path, time::Duration};

use anyhow::Context;
use portal_agent::{ServerManager, ServerProperties, Settings, settings::default_data_root};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_NAME: &str = "portal-agent.log";
const STOP_GRACE: Duration = Duration::from_secs(30);

const HELP: &str = "\
commands:
  download            fetch the latest server package
  extract             unpack the newest package into the server directory
  start | stop        start the server / ask it to stop
  stop-wait           stop, then kill if it is still up after 30s
  status              show the process state
  send <command>      write a raw command to the server console
  say <text>          broadcast a chat message
  get <key> | set <key> <value> | keys
  save | discard      persist or drop pending property edits
  quit";

fn init_tracing(log_dir: &Path) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            tracing::warn!(dir = %log_dir.display(), error = %e, "file logging disabled");
            None
        }
    }
}

fn load_settings() -> anyhow::Result<Settings> {
    match std::env::var("PORTAL_CONFIG") {
        Ok(path) if !path.trim().is_empty() => {
            let mut settings = Settings::load(Path::new(&path))
                .with_context(|| format!("load settings from {path}"))?;
            settings.apply_env()?;
            Ok(settings)
        }
        _ => Ok(Settings::from_env()?),
    }
}

struct Console {
    manager: ServerManager,
    properties: Option<ServerProperties>,
}

impl Console {
    fn properties(&mut self) -> anyhow::Result<&mut ServerProperties> {
        if self.properties.is_none() {
            self.properties = Some(self.manager.edit_properties()?);
        }
        self.properties
            .as_mut()
            .context("properties session unavailable")
    }

    /// Returns `false` once the operator asked to quit.
    async fn run_line(&mut self, line: &str) -> anyhow::Result<bool> {
        let line = line.trim();
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let progress = |m: &str| println!("  {m}");

        match cmd {
            "" => {}
            "help" => println!("{HELP}"),
            "download" => {
                tokio::select! {
                    res = self.manager.download(&progress) => {
                        let report = res?;
                        println!("saved {} ({} bytes)", report.path.display(), report.downloaded_bytes);
                    }
                    _ = tokio::signal::ctrl_c() => println!("download cancelled"),
                }
            }
            "extract" => {
                let report = self.manager.extract(&progress).await?;
                println!(
                    "installed {} into {}",
                    report.image.display(),
                    report.server_dir.display()
                );
            }
            "start" => {
                let session = self.manager.start().await?;
                println!("started session {session}");
            }
            "stop" => self.manager.stop().await?,
            "stop-wait" => {
                if self.manager.stop_and_wait(STOP_GRACE).await? {
                    println!("server stopped");
                } else {
                    println!("server did not stop in time and was killed");
                }
            }
            "status" => {
                let status = self.manager.status().await;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            "send" => self.manager.send_command(rest).await?,
            "say" => self.manager.send_command(&format!("say {rest}")).await?,
            "get" => {
                let value = self.properties()?.get(rest).map(str::to_string);
                match value {
                    Some(v) => println!("{rest}={v}"),
                    None => println!("{rest} is not set"),
                }
            }
            "set" => {
                let (key, value) = rest
                    .split_once(' ')
                    .context("usage: set <key> <value>")?;
                self.properties()?.set(key.trim(), value.trim());
            }
            "keys" => {
                for key in self.properties()?.keys() {
                    println!("{key}");
                }
            }
            "save" => match self.properties.take() {
                Some(props) => {
                    props.save()?;
                    println!("saved {}", props.path().display());
                }
                None => println!("no pending property edits"),
            },
            "discard" => {
                self.properties = None;
            }
            "quit" | "exit" => return Ok(false),
            other => println!("unknown command {other:?}, try `help`"),
        }
        Ok(true)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing(&default_data_root().join("logs"));

    let settings = load_settings()?;
    tracing::info!(
        endpoint = %settings.endpoint,
        download_type = %settings.download_type,
        server_dir = %settings.server_dir.display(),
        "portal-agent starting"
    );
    let manager = ServerManager::new(settings)?;

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", event.line);
        }
    });

    let mut console = Console {
        manager,
        properties: None,
    };
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match console.run_line(&line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {e:#}"),
        }
    }

    console.manager.shutdown().await;
    tracing::info!("portal-agent stopped");
    Ok(())
}
