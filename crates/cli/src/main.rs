use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chatgpt_client::{
    AppContext, AuthState, ClearanceProvider, ClientConfig, ClientError, FileTokenStore,
    TokenStore, VersionChecker,
};
use chatgpt_core::Conversation;
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::Term;
use events::Event;
use indicatif::ProgressBar;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PACKAGE: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "chatgpt-cli")]
#[command(about = "Chat with ChatGPT from the terminal", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding config.toml and the saved session
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Model slug to prefer over the configured one
    #[arg(short, long, global = true)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message, or start an interactive chat when none is given
    Chat { message: Option<String> },
    /// Sign in with email and password
    SignIn {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Forget the saved session
    SignOut,
    /// Use a session token copied from a browser
    SetToken { token: String },
    /// List the models available to the account
    Models,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let dir = match cli.config_dir {
        Some(dir) => dir,
        None => ClientConfig::default_dir().context("Could not determine the config directory")?,
    };
    let context = load_context(&dir, cli.model).await?;

    match cli.command.unwrap_or(Commands::Chat { message: None }) {
        Commands::Chat { message } => chat(&context, message).await,
        Commands::SignIn { username } => sign_in(&context, username).await,
        Commands::SignOut => sign_out(&context).await,
        Commands::SetToken { token } => set_token(&context, &token).await,
        Commands::Models => models(&context).await,
        Commands::Status => status(&context).await,
    }
}

async fn load_context(dir: &Path, model: Option<String>) -> Result<AppContext> {
    let mut config = ClientConfig::read(dir).await;
    if model.is_some() {
        config.model = model;
    }

    let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::in_dir(dir));
    AppContext::with_store(dir, config, store, clearance_provider())
        .await
        .context("Failed to start the client")
}

#[cfg(feature = "chrome")]
fn clearance_provider() -> Option<Arc<dyn ClearanceProvider>> {
    Some(Arc::new(chatgpt_client::ChromeClearance::default()))
}

#[cfg(not(feature = "chrome"))]
fn clearance_provider() -> Option<Arc<dyn ClearanceProvider>> {
    None
}

fn explain(error: ClientError) -> anyhow::Error {
    match error {
        ClientError::NotSignedIn | ClientError::Unauthorized => anyhow!(
            "{error}\nRun `{PACKAGE} sign-in` or `{PACKAGE} set-token <TOKEN>` first"
        ),
        other => anyhow::Error::new(other),
    }
}

async fn chat(context: &AppContext, message: Option<String>) -> Result<()> {
    spawn_update_check(context);
    let mut conversation = Conversation::new();

    if let Some(message) = message {
        return send(context, &mut conversation, &message).await;
    }

    println!("{}", "Type a message, /new for a fresh conversation, /quit to leave.".dimmed());
    loop {
        let line = prompt_line(&format!("{} ", ">".bold())).await?;
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                conversation = Conversation::new();
                println!("{}", "Started a new conversation.".dimmed());
            }
            text => {
                if let Err(e) = send(context, &mut conversation, text).await {
                    eprintln!("{} {e:#}", "error:".red().bold());
                }
            }
        }
    }

    Ok(())
}

async fn send(context: &AppContext, conversation: &mut Conversation, text: &str) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Waiting for a reply");

    let mut rx = context.events.subscribe();
    let progress = {
        let spinner = spinner.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.next().await {
                if let Event::MessageProgress { text, .. } = event {
                    let preview = text.lines().last().unwrap_or_default().to_string();
                    spinner.set_message(preview);
                }
            }
        })
    };

    let result = context.client.send_message(text, conversation).await;
    progress.abort();
    spinner.finish_and_clear();

    let reply = result.map_err(explain)?;
    println!("{}\n", reply.text.unwrap_or_default());
    Ok(())
}

async fn sign_in(context: &AppContext, username: Option<String>) -> Result<()> {
    let username = match username {
        Some(username) => username,
        None => prompt_line("Email: ").await?.trim().to_string(),
    };
    let password = prompt_secret("Password: ").await?;

    let mut events = context.events.subscribe();
    let outcome = tokio::spawn(async move { events.auth_outcome().await });
    let captcha = spawn_captcha_prompt(context);
    let signed_in = context.client.sign_in(&username, &password).await;
    captcha.abort();

    if signed_in.context("Sign-in failed")? {
        outcome.abort();
        let user = context.client.user().await;
        let name = user.map(|user| user.email).unwrap_or(username);
        println!("{} {name}", "Signed in as".green());
        return Ok(());
    }

    match outcome.await {
        Ok(Some(Event::AuthenticationFailed { error, .. })) => {
            Err(anyhow!(error).context("Sign-in failed"))
        }
        _ => Err(anyhow!("Sign-in failed")),
    }
}

/// Answer captcha prompts on stdin while a sign-in runs.
fn spawn_captcha_prompt(context: &AppContext) -> tokio::task::JoinHandle<()> {
    let mut rx = context.events.subscribe();
    let client = context.client.clone();
    let dir = context.dir.clone();

    tokio::spawn(async move {
        while let Some(event) = rx.next().await {
            let Event::CaptchaEncountered { image, mime } = event else {
                continue;
            };

            let path = dir.join(captcha_file_name(&mime));
            if let Err(e) = tokio::fs::write(&path, &image).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to save captcha image");
                client.authenticator().cancel_captcha();
                continue;
            }

            println!("Captcha saved to {}", path.display().to_string().bold());
            match prompt_line("Captcha: ").await {
                Ok(answer) => {
                    client.authenticator().solve_captcha(answer.trim());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read the captcha answer");
                    client.authenticator().cancel_captcha();
                }
            }
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(path = %path.display(), error = %e, "Failed to remove captcha image");
            }
        }
    })
}

fn captcha_file_name(mime: &str) -> String {
    let extension = match mime {
        "image/svg+xml" => "svg",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        _ => "img",
    };
    format!("captcha.{extension}")
}

async fn sign_out(context: &AppContext) -> Result<()> {
    context.client.sign_out().await.context("Failed to sign out")?;
    println!("Signed out.");
    Ok(())
}

async fn set_token(context: &AppContext, token: &str) -> Result<()> {
    context
        .client
        .set_session_token(token)
        .await
        .context("Failed to save the session token")?;

    if context.client.refresh_auth().await.map_err(explain)? {
        println!("{} {}", "Session token accepted:".green(), context.client.hidden_token().await);
        Ok(())
    } else {
        Err(anyhow!("The session token was saved but not accepted by the server"))
    }
}

async fn models(context: &AppContext) -> Result<()> {
    let models = context.client.get_models().await.map_err(explain)?;
    let preferred = context.config.model.as_deref();

    for model in &models {
        if Some(model.as_str()) == preferred {
            println!("{} {}", "*".green(), model.bold());
        } else {
            println!("  {model}");
        }
    }
    Ok(())
}

async fn status(context: &AppContext) -> Result<()> {
    println!();
    println!("Config:  {}", context.dir.display());
    println!("Server:  {}", context.config.chat_url);
    println!("Token:   {}", context.client.hidden_token().await);

    let refreshed = match context.client.refresh_auth().await {
        Ok(refreshed) => refreshed,
        Err(e) => {
            eprintln!("{} {e}", "Session check failed:".yellow());
            false
        }
    };

    let state = context.client.auth_state().await;
    let icon = match state {
        AuthState::Authenticated => "●".green(),
        AuthState::HasSessionToken | AuthState::Refreshing => "◐".yellow(),
        AuthState::NoToken | AuthState::SignedOut => "○".red(),
    };
    println!("State:   {icon} {state}");

    if refreshed {
        if let Some(user) = context.client.user().await {
            println!("User:    {} <{}>", user.name, user.email);
        }
        if let Some(expires) = context.client.session().await.session_expires {
            println!("Expires: {}", expires.format("%Y-%m-%d %H:%M UTC"));
        }
    }

    if context.config.check_updates {
        let checker = VersionChecker::new(VERSION, context.events.clone())?;
        match checker.check(PACKAGE).await {
            Ok(Some(latest)) => println!("Update:  {} available (running {VERSION})", latest.to_string().green()),
            Ok(None) => println!("Version: {VERSION} (latest)"),
            Err(e) => tracing::debug!(error = %e, "Version check failed"),
        }
    }

    println!();
    Ok(())
}

fn spawn_update_check(context: &AppContext) {
    if !context.config.check_updates {
        return;
    }

    let checker = match VersionChecker::new(VERSION, context.events.clone()) {
        Ok(checker) => checker,
        Err(e) => {
            tracing::debug!(error = %e, "Version check unavailable");
            return;
        }
    };

    tokio::spawn(async move {
        match checker.check(PACKAGE).await {
            Ok(Some(latest)) => eprintln!(
                "{}",
                format!("{PACKAGE} {latest} is available (running {VERSION})").yellow()
            ),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "Version check failed"),
        }
    });
}

async fn prompt_line(prompt: &str) -> Result<String> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || {
        let term = Term::stderr();
        term.write_str(&prompt)?;
        term.read_line()
    })
    .await
    .context("Input task failed")?
    .context("Failed to read from the terminal")
}

async fn prompt_secret(prompt: &str) -> Result<String> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || {
        let term = Term::stderr();
        term.write_str(&prompt)?;
        term.read_secure_line()
    })
    .await
    .context("Input task failed")?
    .context("Failed to read from the terminal")
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatgpt_cli=info,chatgpt_client=warn,network=warn".into()),
        )
        .init();
}
