//! Sigminer CLI
//!
//! Signs in to a Microsoft 365 mailbox, manages extraction presets and runs
//! extractions that merge sender details into a CSV contact list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use sigminer_core::auth::{OAuthManager, OAuthTokens};
use sigminer_core::config::{Config, Settings};
use sigminer_core::extraction::{ExtractionEvent, ExtractionRunner};
use sigminer_core::llm::OpenAiExtractor;
use sigminer_core::mail::GraphClient;
use sigminer_core::models::{FieldConfig, LauncherConfig};

#[derive(Parser)]
#[command(name = "sigminer")]
#[command(about = "Sigminer - Extract sender details from your mailbox into a CSV contact list")]
#[command(long_about = "Sigminer reads your Microsoft 365 mailbox, asks an LLM to extract the \
fields you configure (company, job title, phone...) from each email and its signature images, \
and merges the answers into a CSV file keyed by sender address.

QUICK START:
  1. Register the app:   sigminer config set-client-id <ID> && sigminer config set-tenant-id common
  2. Set the LLM key:    sigminer config set-api-key sk-...
  3. Sign in:            sigminer auth login
  4. Create a preset:    sigminer preset save leads --file leads.csv --field company --field job_title
  5. Run it:             sigminer run --preset leads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output JSON instead of human-readable text where supported
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in to the mailbox, check or forget the cached account
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Show or change identity ids and the LLM API key
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Manage saved extraction presets
    Preset {
        #[command(subcommand)]
        command: PresetCommands,
    },
    /// Run an extraction with a saved preset. Ctrl-C cancels and leaves the CSV untouched.
    Run {
        /// Preset name
        #[arg(long)]
        preset: String,

        /// Override the preset's email cap (0 for no cap)
        #[arg(long)]
        max_emails: Option<usize>,

        /// Override the preset's destination CSV
        #[arg(long)]
        file: Option<PathBuf>,

        /// Override the preset's model
        #[arg(long)]
        model: Option<String>,
    },
}

// ============================================================================
// Auth Commands
// ============================================================================

#[derive(Subcommand)]
enum AuthCommands {
    /// Sign in with a device code
    Login,
    /// Show the cached account and token expiry
    Status,
    /// Delete the token cache
    Logout,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the configuration (API key masked)
    Show,
    /// Set the identity application (client) id
    SetClientId { client_id: String },
    /// Set the identity tenant id ("common" for personal accounts)
    SetTenantId { tenant_id: String },
    /// Set the LLM API key
    SetApiKey { api_key: String },
}

// ============================================================================
// Preset Commands
// ============================================================================

#[derive(Subcommand)]
enum PresetCommands {
    /// List saved presets
    List,
    /// Show one preset
    Show { name: String },
    /// Create or replace a preset
    #[command(long_about = "Create or replace a preset, either from a JSON file or from flags.

EXAMPLES:
  sigminer preset save leads --file leads.csv --field company=\"Legal name only\" --field job_title
  sigminer preset save leads --file leads.csv --field company --overwrite company --host gmail.com
  sigminer preset save partners --from-json partners.json")]
    Save {
        name: String,

        /// Read the whole preset from a JSON file
        #[arg(long, conflicts_with_all = ["file", "fields", "overwrite", "hosts", "include_mode", "max_emails", "model"])]
        from_json: Option<PathBuf>,

        /// Destination CSV
        #[arg(long)]
        file: Option<PathBuf>,

        /// Field to extract, as NAME or NAME=GUIDELINE (repeatable, in column order)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<FieldConfig>,

        /// Field whose existing value may be replaced by a new answer (repeatable)
        #[arg(long)]
        overwrite: Vec<String>,

        /// Sender host for the allow/deny list (repeatable)
        #[arg(long = "host")]
        hosts: Vec<String>,

        /// Only process the listed hosts instead of skipping them
        #[arg(long)]
        include_mode: bool,

        /// Maximum emails to fetch (0 for no cap)
        #[arg(long)]
        max_emails: Option<usize>,

        /// LLM model
        #[arg(long)]
        model: Option<String>,
    },
    /// Delete a preset
    Delete { name: String },
}

fn parse_field(value: &str) -> std::result::Result<FieldConfig, String> {
    let (name, guideline) = value.split_once('=').unwrap_or((value, ""));
    let name = name.trim();
    if name.is_empty() {
        return Err("field name must not be empty".to_string());
    }
    Ok(FieldConfig::new(name, guideline.trim()))
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = Config::load().map(|c| c.settings).unwrap_or_default();
    if let Err(e) = init_logging(&settings) {
        eprintln!("Warning: file logging disabled: {}", e);
    }

    if let Err(e) = dispatch(cli).await {
        report_error(&e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Auth { command } => handle_auth_command(command, json).await,
        Commands::Config { command } => handle_config_command(command, json),
        Commands::Preset { command } => handle_preset_command(command, json),
        Commands::Run {
            preset,
            max_emails,
            file,
            model,
        } => run_extraction(&preset, max_emails, file, model).await,
    }
}

/// Stderr output filtered by `RUST_LOG` plus an append-only run log file
fn init_logging(settings: &Settings) -> Result<()> {
    let stderr_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sigminer_core={0},sigminer={0},warn", settings.log_level)));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(stderr_filter);

    let log_dir = match settings.log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let log_name = settings
        .log_file
        .file_name()
        .context("log_file has no file name")?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(&log_dir, log_name);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_ansi(false)
        .with_target(false)
        .with_filter(EnvFilter::new(format!(
            "sigminer_core={0},sigminer={0},warn",
            settings.log_level
        )));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn report_error(error: &anyhow::Error) {
    eprintln!("Error: {:#}", error);
    if let Some(hint) = error
        .downcast_ref::<sigminer_core::Error>()
        .and_then(|e| e.action_hint())
    {
        eprintln!("  {}", hint);
    }
}

// ============================================================================
// Auth Command Handlers
// ============================================================================

#[derive(Serialize)]
struct AuthStatus {
    signed_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<String>,
    expired: bool,
    can_refresh: bool,
    scopes: Vec<String>,
    token_cache: PathBuf,
}

async fn handle_auth_command(command: AuthCommands, json: bool) -> Result<()> {
    let config = Config::load()?;
    let oauth = OAuthManager::from_config(&config)?;

    match command {
        AuthCommands::Login => {
            let tokens = device_login(&oauth).await?;
            println!(
                "✓ Signed in as {}",
                tokens.account.as_deref().unwrap_or("your account")
            );
        }

        AuthCommands::Status => {
            let tokens = oauth.store().load().await?;
            let status = AuthStatus {
                signed_in: tokens.is_some(),
                account: tokens.as_ref().and_then(|t| t.account.clone()),
                expires_at: tokens.as_ref().and_then(|t| format_timestamp(t.expires_at)),
                expired: tokens.as_ref().map_or(true, |t| t.is_expired()),
                can_refresh: tokens.as_ref().is_some_and(|t| t.can_refresh()),
                scopes: tokens.map(|t| t.scopes).unwrap_or_default(),
                token_cache: config.token_cache_path(),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else if !status.signed_in {
                println!("Not signed in. Run `sigminer auth login`.");
            } else {
                println!("Account:     {}", status.account.as_deref().unwrap_or("(unknown)"));
                println!(
                    "Token:       {}{}",
                    if status.expired { "expired" } else { "valid" },
                    status
                        .expires_at
                        .as_deref()
                        .map(|at| format!(" (expires {})", at))
                        .unwrap_or_default()
                );
                println!("Refreshable: {}", if status.can_refresh { "yes" } else { "no" });
                println!("Cache:       {}", status.token_cache.display());
            }
        }

        AuthCommands::Logout => {
            oauth.logout().await?;
            println!("✓ Signed out");
        }
    }

    Ok(())
}

async fn device_login(oauth: &OAuthManager) -> Result<OAuthTokens> {
    let code = oauth.start_device_flow().await?;
    if code.message.is_empty() {
        eprintln!(
            "To sign in, open {} and enter the code {}",
            code.verification_uri, code.user_code
        );
    } else {
        eprintln!("{}", code.message);
    }
    let tokens = oauth.complete_device_flow(&code).await?;
    info!("Signed in as {}", tokens.account.as_deref().unwrap_or("unknown account"));
    Ok(tokens)
}

/// Cached token, or a device-code sign-in when none can be refreshed
async fn access_token(oauth: &OAuthManager) -> Result<String> {
    match oauth.get_access_token().await {
        Ok(token) => Ok(token),
        Err(e) if e.requires_reauth() => {
            warn!("{}", e);
            Ok(device_login(oauth).await?.access_token)
        }
        Err(e) => Err(e.into()),
    }
}

fn format_timestamp(timestamp: i64) -> Option<String> {
    Local
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

// ============================================================================
// Config Command Handlers
// ============================================================================

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", chars[..3].iter().collect::<String>(), tail)
}

fn handle_config_command(command: ConfigCommands, json: bool) -> Result<()> {
    let mut config = Config::load()?;

    match command {
        ConfigCommands::Show => {
            let api_key = config.api_key().map(|k| mask_secret(&k));
            if json {
                let value = serde_json::json!({
                    "config_file": config.path(),
                    "token_cache": config.token_cache_path(),
                    "client_id": config.client_id,
                    "tenant_id": config.tenant_id,
                    "api_key": api_key,
                    "settings": config.settings,
                    "presets": config.list_presets(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                let unset = "(not set)";
                println!("Config file:  {}", config.path().display());
                println!("Token cache:  {}", config.token_cache_path().display());
                println!("Client id:    {}", config.client_id.as_deref().unwrap_or(unset));
                println!("Tenant id:    {}", config.tenant_id.as_deref().unwrap_or(unset));
                println!("API key:      {}", api_key.as_deref().unwrap_or(unset));
                println!("LLM endpoint: {}", config.settings.llm_base_url);
                println!(
                    "Fallback:     {}",
                    config.settings.fallback_model.as_deref().unwrap_or("(none)")
                );
                println!(
                    "Concurrency:  {} requests, {} emails, {}/s",
                    config.settings.max_in_flight_requests,
                    config.settings.max_concurrent_emails,
                    config.settings.rate_limit_per_second
                );
                println!("Log file:     {}", config.settings.log_file.display());
                println!("Presets:      {}", config.list_presets().len());
            }
        }

        ConfigCommands::SetClientId { client_id } => {
            config.set_client_id(client_id.trim())?;
            println!("✓ Client id saved");
        }

        ConfigCommands::SetTenantId { tenant_id } => {
            config.set_tenant_id(tenant_id.trim())?;
            println!("✓ Tenant id saved");
        }

        ConfigCommands::SetApiKey { api_key } => {
            config.set_api_key(api_key.trim())?;
            println!("✓ API key saved");
        }
    }

    Ok(())
}

// ============================================================================
// Preset Command Handlers
// ============================================================================

fn handle_preset_command(command: PresetCommands, json: bool) -> Result<()> {
    let mut config = Config::load()?;

    match command {
        PresetCommands::List => {
            let names = config.list_presets();
            if json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else if names.is_empty() {
                println!("No presets saved.");
            } else {
                for name in names {
                    println!("{}", name);
                }
            }
        }

        PresetCommands::Show { name } => {
            let preset = config.get_preset(&name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(preset)?);
            } else {
                print_preset(&name, preset);
            }
        }

        PresetCommands::Save {
            name,
            from_json,
            file,
            fields,
            overwrite,
            hosts,
            include_mode,
            max_emails,
            model,
        } => {
            let preset = match from_json {
                Some(path) => read_preset_file(&path)?,
                None => {
                    let file = file.context("--file is required unless --from-json is given")?;
                    let mut preset = LauncherConfig::new(file);
                    preset.fields = fields
                        .into_iter()
                        .map(|field| {
                            if overwrite.contains(&field.field_name) {
                                field.overwritable()
                            } else {
                                field
                            }
                        })
                        .collect();
                    preset.excluded_hosts = hosts.into_iter().map(|h| h.trim().to_string()).collect();
                    preset.include_mode = include_mode;
                    preset.max_emails = max_emails;
                    if let Some(model) = model {
                        preset.model = model;
                    }
                    preset
                }
            };
            preset.validate()?;
            config.save_preset(&name, preset)?;
            println!("✓ Preset '{}' saved", name.trim());
        }

        PresetCommands::Delete { name } => {
            config.delete_preset(&name)?;
            println!("✓ Preset '{}' deleted", name);
        }
    }

    Ok(())
}

fn read_preset_file(path: &Path) -> Result<LauncherConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("invalid preset in {}", path.display()))
}

fn print_preset(name: &str, preset: &LauncherConfig) {
    println!("Preset:     {}", name);
    println!("File:       {}", preset.file_path.display());
    println!("Model:      {}", preset.model);
    println!(
        "Max emails: {}",
        preset
            .email_limit()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "no limit".to_string())
    );
    if !preset.excluded_hosts.is_empty() {
        let hosts: Vec<&str> = preset.excluded_hosts.iter().map(String::as_str).collect();
        println!(
            "{} {}",
            if preset.include_mode { "Only hosts:" } else { "Skip hosts:" },
            hosts.join(", ")
        );
    }
    println!("Fields:");
    for field in &preset.fields {
        let marker = if field.can_be_overwritten { " (overwrite)" } else { "" };
        if field.guideline.is_empty() {
            println!("  - {}{}", field.field_name, marker);
        } else {
            println!("  - {}{}: {}", field.field_name, marker, field.guideline);
        }
    }
}

// ============================================================================
// Run Command Handler
// ============================================================================

async fn run_extraction(
    preset_name: &str,
    max_emails: Option<usize>,
    file: Option<PathBuf>,
    model: Option<String>,
) -> Result<()> {
    let config = Config::load()?;
    let mut preset = config.get_preset(preset_name)?.clone();
    if let Some(max_emails) = max_emails {
        preset.max_emails = Some(max_emails);
    }
    if let Some(file) = file {
        preset.file_path = file;
    }
    if let Some(model) = model {
        preset.model = model;
    }
    preset.validate()?;

    let api_key = config.api_key().context(
        "no LLM API key configured; run `sigminer config set-api-key` or set OPENAI_API_KEY",
    )?;

    let oauth = OAuthManager::from_config(&config)?;
    let token = access_token(&oauth).await?;

    let mailbox = Arc::new(GraphClient::with_settings(token, &config.settings)?);
    let extractor = Arc::new(OpenAiExtractor::new(Some(api_key), &config.settings)?);
    let runner = ExtractionRunner::new(mailbox, extractor, &config.settings);

    // Log lines already reach stderr and the log file through tracing
    let mut events = runner
        .take_event_receiver()
        .context("event receiver already taken")?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ExtractionEvent::Progress(percent) => eprintln!("[{:>3}%]", percent),
                ExtractionEvent::Phase(phase) => eprintln!("→ {}", phase),
                ExtractionEvent::Log(_) | ExtractionEvent::Summary(_) => {}
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            on_ctrl_c.cancel();
        }
    });

    let result = runner.run(&preset, cancel).await;
    drop(runner);
    let _ = printer.await;

    let summary = result?;
    println!("{}", summary);
    println!("✓ Contacts saved to {}", preset.file_path.display());
    Ok(())
}
