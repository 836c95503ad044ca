use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use kindred::api::ApiClient;
use kindred::auth::{AuthService, CredentialStore, FileCredentialStore};
use kindred::chat::{
    ChatEvent, ChatMessage, ChatSessionManager, HistoryFetcher, OpenOutcome, WsConnector,
};
use kindred::config::{self, APP_NAME, ClientConfig};
use kindred::profile::{PhotoUpload, ProfileService};
use kindred::protocol::profiles::{CurrentProfile, PublicProfile};
use kindred::protocol::social::SwipeAction;
use kindred::social::SocialService;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Config { command } => handle_config(&ctx, command),
        Command::Client(command) => run(ctx, command),
    }
}

#[tokio::main]
async fn run(ctx: RuntimeContext, command: ClientCommand) -> Result<()> {
    let app = App::new(&ctx)?;
    match command {
        ClientCommand::Login(cmd) => handle_login(&app, cmd).await,
        ClientCommand::Register(cmd) => handle_register(&app, cmd).await,
        ClientCommand::Logout => handle_logout(&app),
        ClientCommand::Me => handle_me(&ctx, &app).await,
        ClientCommand::Feed => handle_feed(&ctx, &app).await,
        ClientCommand::Swipe(cmd) => handle_swipe(&ctx, &app, cmd).await,
        ClientCommand::Matches => handle_matches(&ctx, &app).await,
        ClientCommand::Photo { command } => handle_photo(&app, command).await,
        ClientCommand::Chat(cmd) => handle_chat(&ctx, &app, cmd).await,
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Kindred - command line client for the Kindred matching service.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(flatten)]
    Client(ClientCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    /// Sign in and store the issued credentials
    Login(LoginCommand),
    /// Create an account and sign in
    Register(RegisterCommand),
    /// Forget the stored credentials
    Logout,
    /// Show your own profile
    Me,
    /// List profiles to swipe on
    Feed,
    /// Like or pass on a profile
    Swipe(SwipeCommand),
    /// List your matches
    Matches,
    /// Manage profile photos
    Photo {
        #[command(subcommand)]
        command: PhotoCommand,
    },
    /// Open a live chat with a match
    Chat(ChatCommand),
}

#[derive(Debug, Clone, Args)]
struct LoginCommand {
    email: String,
    /// Password (prefer the environment variable)
    #[arg(long, env = "KINDRED_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Debug, Clone, Args)]
struct RegisterCommand {
    email: String,
    #[arg(long, env = "KINDRED_PASSWORD", hide_env_values = true)]
    password: String,
    /// Repeat the password; defaults to --password
    #[arg(long)]
    password_confirm: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SwipeChoice {
    Like,
    Dislike,
}

impl From<SwipeChoice> for SwipeAction {
    fn from(choice: SwipeChoice) -> Self {
        match choice {
            SwipeChoice::Like => SwipeAction::Like,
            SwipeChoice::Dislike => SwipeAction::Dislike,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct SwipeCommand {
    /// Profile id
    target: String,
    #[arg(value_enum)]
    action: SwipeChoice,
}

#[derive(Debug, Subcommand)]
enum PhotoCommand {
    /// Upload a photo
    Add {
        path: PathBuf,
        /// Make it the main photo
        #[arg(long)]
        main: bool,
        #[arg(long)]
        caption: Option<String>,
    },
    /// Delete a photo by id
    Rm { id: String },
}

#[derive(Debug, Clone, Args)]
struct ChatCommand {
    /// Match id of the conversation
    match_id: String,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: ClientConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match &common.config {
            Some(path) => {
                let expanded = match path.to_str() {
                    Some(text) => config::expand_str_path(text)?,
                    None => path.clone(),
                };
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => config::default_config_dir()?.join("config.toml"),
        };

        if !config_file.exists() {
            config::write_default_config(&config_file)
                .with_context(|| format!("creating default config {}", config_file.display()))?;
        }
        let config = ClientConfig::load(&config_file)
            .with_context(|| format!("loading config {}", config_file.display()))?;

        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            return;
        }

        let level = match self.common.verbose {
            0 => self.config.logging.level.as_str(),
            1 => "debug",
            _ => "trace",
        };
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let disable_color = self.common.no_color
                || env::var_os("NO_COLOR").is_some()
                || !io::stderr().is_terminal();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        }
    }

    fn print_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        );
        Ok(())
    }
}

struct App {
    api: Arc<ApiClient>,
    auth: AuthService,
    profiles: Arc<ProfileService>,
    social: SocialService,
}

impl App {
    fn new(ctx: &RuntimeContext) -> Result<Self> {
        let path = ctx.config.credentials_path()?;
        let store = FileCredentialStore::open(&path)
            .with_context(|| format!("opening credential store {}", path.display()))?;
        let credentials: Arc<dyn CredentialStore> = Arc::new(store);
        let api = Arc::new(
            ApiClient::new(
                ctx.config.api.base_url.clone(),
                ctx.config.request_timeout(),
                credentials,
            )
            .context("creating HTTP client")?,
        );
        Ok(Self {
            auth: AuthService::new(api.clone()),
            profiles: Arc::new(ProfileService::new(api.clone())),
            social: SocialService::new(api.clone()),
            api,
        })
    }

    fn require_login(&self) -> Result<()> {
        if self.auth.is_authenticated() {
            Ok(())
        } else {
            Err(anyhow!("not signed in (run `{APP_NAME} login <email>`)"))
        }
    }
}

async fn handle_login(app: &App, cmd: LoginCommand) -> Result<()> {
    app.auth
        .login(&cmd.email, &cmd.password)
        .await
        .context("signing in")?;
    println!("Signed in as {}", cmd.email);
    Ok(())
}

async fn handle_register(app: &App, cmd: RegisterCommand) -> Result<()> {
    let confirm = cmd.password_confirm.as_deref().unwrap_or(&cmd.password);
    app.auth
        .register(&cmd.email, &cmd.password, confirm)
        .await
        .context("registering")?;
    println!("Registered and signed in as {}", cmd.email);
    Ok(())
}

fn handle_logout(app: &App) -> Result<()> {
    app.auth.logout().context("clearing credentials")?;
    app.profiles.clear();
    println!("Signed out");
    Ok(())
}

async fn handle_me(ctx: &RuntimeContext, app: &App) -> Result<()> {
    app.require_login()?;
    let me = app.profiles.me().await.context("fetching profile")?;
    if ctx.common.json {
        return ctx.print_json(&me);
    }
    print_current_profile(&me);
    Ok(())
}

async fn handle_feed(ctx: &RuntimeContext, app: &App) -> Result<()> {
    app.require_login()?;
    let profiles = app.profiles.feed().await.context("fetching feed")?;
    if ctx.common.json {
        return ctx.print_json(&profiles);
    }
    if profiles.is_empty() {
        println!("No profiles right now. Try widening your preferences.");
    }
    for profile in &profiles {
        print_public_profile(profile);
    }
    Ok(())
}

async fn handle_swipe(ctx: &RuntimeContext, app: &App, cmd: SwipeCommand) -> Result<()> {
    app.require_login()?;
    let response = app
        .social
        .swipe(&cmd.target, cmd.action.into())
        .await
        .context("sending swipe")?;
    if ctx.common.json {
        return ctx.print_json(&response);
    }
    match response.match_details {
        Some(details) if response.is_match => {
            println!("It's a match! Chat with `{APP_NAME} chat {}`", details.id)
        }
        _ if response.is_match => println!("It's a match!"),
        _ => println!("Swipe recorded"),
    }
    Ok(())
}

async fn handle_matches(ctx: &RuntimeContext, app: &App) -> Result<()> {
    app.require_login()?;
    let matches = app.social.matches().await.context("fetching matches")?;
    if ctx.common.json {
        return ctx.print_json(&matches);
    }
    if matches.is_empty() {
        println!("No matches yet");
    }
    for m in &matches {
        let name = m
            .other_user
            .as_ref()
            .map(|user| user.first_name.as_str())
            .unwrap_or("(unknown)");
        println!("{}  {}  since {}", m.id, name, m.created_at.format("%Y-%m-%d"));
    }
    Ok(())
}

async fn handle_photo(app: &App, command: PhotoCommand) -> Result<()> {
    app.require_login()?;
    match command {
        PhotoCommand::Add {
            path,
            main,
            caption,
        } => {
            let mut upload = PhotoUpload::from_path(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            upload.is_main = main;
            upload.caption = caption;
            let photo = app
                .profiles
                .upload_photo(upload)
                .await
                .context("uploading photo")?;
            println!("Uploaded photo {} ({})", photo.id, photo.image);
        }
        PhotoCommand::Rm { id } => {
            app.profiles
                .delete_photo(&id)
                .await
                .context("deleting photo")?;
            println!("Deleted photo {id}");
        }
    }
    Ok(())
}

async fn handle_chat(ctx: &RuntimeContext, app: &App, cmd: ChatCommand) -> Result<()> {
    app.require_login()?;
    app.profiles
        .me()
        .await
        .context("fetching profile for chat identity")?;

    let manager = ChatSessionManager::new(
        HistoryFetcher::new(app.api.clone(), ctx.config.history.retry_policy()),
        Arc::new(WsConnector::new(ctx.config.api.ws_url.clone())),
        app.api.credentials().clone(),
        app.profiles.clone(),
    );
    let mut events = manager.subscribe();

    if manager.open(&cmd.match_id).await? == OpenOutcome::Superseded {
        return Ok(());
    }
    for message in manager.messages().await {
        print_chat_message(ctx, &message)?;
    }
    eprintln!("Connected. Type a message and press enter; /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) => manager.send(&line).await,
                None => break,
            },
            event = events.recv() => match event {
                Ok(ChatEvent::Message { message, .. }) => print_chat_message(ctx, &message)?,
                Ok(ChatEvent::StreamClosed { .. }) => {
                    eprintln!("Connection closed by server");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} chat events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.close().await;
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                ctx.print_json(&ctx.config)
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
                Ok(())
            }
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
    }
}

fn print_chat_message(ctx: &RuntimeContext, message: &ChatMessage) -> Result<()> {
    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string(message).context("serializing message")?
        );
    } else {
        let who = if message.is_mine { "you" } else { "them" };
        println!(
            "[{}] {}: {}",
            message.created_at.format("%H:%M"),
            who,
            message.text
        );
    }
    Ok(())
}

fn print_public_profile(profile: &PublicProfile) {
    let age = profile
        .age
        .map(|age| format!(", {age}"))
        .unwrap_or_default();
    let distance = profile
        .distance_km
        .map(|km| format!(" ({km} km away)"))
        .unwrap_or_default();
    println!("{}  {}{}{}", profile.id, profile.first_name, age, distance);
    if let Some(bio) = profile.bio.as_deref().filter(|bio| !bio.is_empty()) {
        println!("    {bio}");
    }
}

fn print_current_profile(profile: &CurrentProfile) {
    println!("{} <{}>", profile.first_name, profile.email);
    if let Some(bio) = &profile.bio {
        println!("bio:    {bio}");
    }
    if let Some(work) = &profile.work {
        println!("work:   {work}");
    }
    if let Some(age) = profile.age {
        println!("age:    {age}");
    }
    println!("photos: {}", profile.photos.len());
    if let Some(main) = profile.main_photo() {
        println!("main:   {}", main.image);
    }
}
