use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ecosort_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use ecosort_contracts::events::EventWriter;
use ecosort_contracts::history::format_confidence;
use ecosort_engine::diagnostics::{
    render_combined_stats, render_detailed_stats, render_live_history, render_session_detail,
    render_session_line, Diagnostics,
};
use ecosort_engine::live::LiveView;
use ecosort_engine::transcript::{Entry, EntryKind, TranscriptView};
use ecosort_engine::{
    BackendClient, ButtonGate, ConnectionState, EngineConfig, HistoryReplay, IdentityStore,
    LiveAnalyzer, MessageFlow, SendOutcome, SessionTransport, SocketTransport, StagedImages,
    StatusPanel, Transcript, TypingReveal,
};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "ecosort-rs", version, about = "EcoSort recycling assistant CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Live(LiveArgs),
    History(HistoryArgs),
    Stats(StatsArgs),
    Reset(ResetArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    session_transport: Option<String>,
    #[arg(long)]
    state_dir: Option<PathBuf>,
    #[arg(long)]
    typing_interval_ms: Option<u64>,
}

#[derive(Debug, Parser)]
struct LiveArgs {
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    socket_url: Option<String>,
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Analyze this URL right after startup.
    #[arg(long)]
    url: Option<String>,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Parser)]
struct StatsArgs {
    #[arg(long)]
    base_url: Option<String>,
    /// Per-session detail rows instead of the combined totals.
    #[arg(long)]
    detailed: bool,
    /// Ask the backend to drop expired sessions first.
    #[arg(long)]
    cleanup: bool,
}

#[derive(Debug, Parser)]
struct ResetArgs {
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    session_transport: Option<String>,
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

const LIVE_HISTORY_REPL_LIMIT: usize = 20;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("ecosort-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Live(args) => {
            run_live(args)?;
            Ok(0)
        }
        Command::History(args) => run_history(args),
        Command::Stats(args) => run_stats(args),
        Command::Reset(args) => run_reset(args),
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let config = build_config(args.overrides())?;
    let events = open_events(&config)?;
    let backend = BackendClient::new(&config)?;
    let identity = Arc::new(IdentityStore::new(&config, backend.clone(), events.clone()));
    identity.resolve();

    println!("EcoSort chat iniciado. Escribe /help para ver los comandos.");

    let view: Arc<dyn TranscriptView> = Arc::new(TerminalTranscript);
    let transcript = Arc::new(Mutex::new(Transcript::new(view)));
    let gate = ButtonGate::new();

    let replay = HistoryReplay::new(
        backend.clone(),
        identity.clone(),
        transcript.clone(),
        events.clone(),
    );
    let summary = replay.load();
    println!(
        "{}",
        render_session_line(&summary, identity.current_id().as_deref())
    );

    let typing = TypingReveal::new(transcript.clone(), gate.clone(), config.typing_interval_ms);
    let flow = MessageFlow::new(
        backend.clone(),
        identity.clone(),
        transcript.clone(),
        gate.clone(),
        typing.clone(),
        events,
    );
    let diagnostics = Diagnostics::new(backend.clone());
    let mut staged = StagedImages::default();

    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        // While a reveal runs, the worker restores the prompt itself.
        if gate.can_send() {
            print!("> ");
            io::stdout().flush()?;
        }

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        if intent.action == "noop" {
            // Enter on an empty line sends staged attachments by
            // themselves, like the send button with an empty box.
            if !staged.is_empty() {
                dispatch_send(&flow, &mut staged, "");
            }
            continue;
        }

        match intent.action.as_str() {
            "help" => {
                println!("Comandos: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            "attach" => {
                let paths: Vec<String> = intent
                    .command_args
                    .get("paths")
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|value| value.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                if paths.is_empty() {
                    println!("/attach necesita al menos una ruta de imagen");
                    continue;
                }
                for path_text in paths {
                    match staged.attach_file(Path::new(&path_text)) {
                        Ok(name) => println!("Imagen preparada: {name}"),
                        Err(err) => println!("No se pudo preparar {path_text}: {err:#}"),
                    }
                }
            }
            "remove_image" => {
                let index = intent
                    .command_args
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|value| value as usize);
                let Some(index) = index else {
                    println!("/remove necesita el número de la imagen (ver /images)");
                    continue;
                };
                match staged.remove(index) {
                    Some(removed) => println!("Imagen {index} quitada: {}", removed.display()),
                    None => println!("No hay imagen {index}"),
                }
            }
            "list_images" => {
                if staged.is_empty() {
                    println!("No hay imágenes preparadas.");
                } else {
                    for (position, item) in staged.iter().enumerate() {
                        let origin = if item.is_file() { "archivo" } else { "url" };
                        println!("  {} ({origin}): {}", position + 1, item.display());
                    }
                }
            }
            "cancel" => {
                if gate.can_send() {
                    println!("No hay ninguna respuesta en curso.");
                } else {
                    typing.cancel();
                }
            }
            "reset_history" => match backend.reset_history() {
                Ok(reply) if reply.success => {
                    identity.reset();
                    staged.clear();
                    if let Ok(mut transcript) = transcript.lock() {
                        transcript.reset_to_welcome();
                    }
                }
                Ok(reply) => {
                    let reason = reply
                        .error
                        .unwrap_or_else(|| "respuesta sin detalle".to_string());
                    println!("No se pudo reiniciar el historial: {reason}");
                }
                Err(err) => println!("No se pudo reiniciar el historial: {err:#}"),
            },
            "session_info" => match identity.session() {
                Some(session) => {
                    println!("{}", render_session_detail(&session, config.transport))
                }
                None => println!(
                    "Sin sesión activa (transporte {}).",
                    config.transport.as_str()
                ),
            },
            "stats" => match diagnostics.combined_stats() {
                Ok(stats) => println!("{}", render_combined_stats(&stats)),
                Err(err) => println!("No se pudieron obtener las estadísticas: {err:#}"),
            },
            "live_history" => match diagnostics.live_history() {
                Ok(history) => {
                    println!("{}", render_live_history(&history, LIVE_HISTORY_REPL_LIMIT))
                }
                Err(err) => println!("No se pudo obtener el historial en vivo: {err:#}"),
            },
            "exit" => break,
            "message" => {
                let text = intent.message.clone().unwrap_or_default();
                staged.sync_urls_with_text(&text);
                dispatch_send(&flow, &mut staged, &text);
            }
            _ => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_else(|| intent.action.clone());
                println!("Comando desconocido: /{command} (usa /help)");
            }
        }
    }

    typing.cancel();
    Ok(())
}

fn dispatch_send(flow: &MessageFlow, staged: &mut StagedImages, text: &str) {
    match flow.send_message(text, staged) {
        SendOutcome::EmptyInput => {
            println!("Escribe un mensaje o prepara una imagen con /attach.")
        }
        SendOutcome::Busy => println!("Hay un análisis en curso; espera o usa /cancel."),
        SendOutcome::Revealing | SendOutcome::Failed => {}
    }
}

fn run_live(args: LiveArgs) -> Result<()> {
    let config = build_config(args.overrides())?;
    let events = open_events(&config)?;
    let backend = BackendClient::new(&config)?;

    println!("EcoSort live iniciado. Pega una URL de imagen para analizarla; /exit para salir.");

    let view: Arc<dyn LiveView> = Arc::new(TerminalLiveView::new());
    let panel = Arc::new(StatusPanel::new(view));
    let transport = SocketTransport::new(&config.socket_url, events.clone(), panel.clone());
    let analyzer = Arc::new(LiveAnalyzer::new(
        backend,
        panel,
        Arc::new(transport.probe()),
        events,
    ));
    transport.start(analyzer.clone())?;

    if let Some(url) = args.url.as_deref() {
        analyzer.handle_external_trigger(url);
    }

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                transport.stop();
                return Err(err.into());
            }
        };
        if read == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if let Some(rest) = input.strip_prefix('/') {
            let command = rest.trim();
            if command.eq_ignore_ascii_case("exit") || command.eq_ignore_ascii_case("quit") {
                break;
            }
            println!("Comando desconocido: /{command}");
            continue;
        }
        analyzer.handle_external_trigger(input);
    }

    transport.stop();
    Ok(())
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    let config = build_config(args.overrides())?;
    let backend = BackendClient::new(&config)?;
    let diagnostics = Diagnostics::new(backend);
    let history = diagnostics.live_history()?;
    println!("{}", render_live_history(&history, args.limit));
    Ok(0)
}

fn run_stats(args: StatsArgs) -> Result<i32> {
    let config = build_config(args.overrides())?;
    let backend = BackendClient::new(&config)?;
    let diagnostics = Diagnostics::new(backend);
    if args.cleanup {
        let reply = diagnostics.cleanup_sessions()?;
        if !reply.success {
            let reason = reply
                .error
                .unwrap_or_else(|| "respuesta sin detalle".to_string());
            bail!("la limpieza de sesiones falló: {reason}");
        }
        let message = reply
            .message
            .unwrap_or_else(|| "limpieza completada".to_string());
        println!("Limpieza de sesiones: {message}");
    }
    let rendered = if args.detailed {
        render_detailed_stats(&diagnostics.detailed_stats()?)
    } else {
        render_combined_stats(&diagnostics.combined_stats()?)
    };
    println!("{rendered}");
    Ok(0)
}

fn run_reset(args: ResetArgs) -> Result<i32> {
    let config = build_config(args.overrides())?;
    let events = open_events(&config)?;
    let backend = BackendClient::new(&config)?;
    let identity = IdentityStore::new(&config, backend.clone(), events);
    let reply = backend.reset_history()?;
    if !reply.success {
        let reason = reply
            .error
            .unwrap_or_else(|| "respuesta sin detalle".to_string());
        bail!("el servidor rechazó el reinicio: {reason}");
    }
    match identity.reset() {
        Some(id) => println!("Historial reiniciado. Nueva sesión: {id}"),
        None => println!("Historial reiniciado."),
    }
    Ok(0)
}

impl ChatArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            base_url: self.base_url.clone(),
            session_transport: self.session_transport.clone(),
            state_dir: self.state_dir.clone(),
            typing_interval_ms: self.typing_interval_ms,
            ..ConfigOverrides::default()
        }
    }
}

impl LiveArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            base_url: self.base_url.clone(),
            socket_url: self.socket_url.clone(),
            state_dir: self.state_dir.clone(),
            ..ConfigOverrides::default()
        }
    }
}

impl HistoryArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            base_url: self.base_url.clone(),
            ..ConfigOverrides::default()
        }
    }
}

impl StatsArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            base_url: self.base_url.clone(),
            ..ConfigOverrides::default()
        }
    }
}

impl ResetArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            base_url: self.base_url.clone(),
            session_transport: self.session_transport.clone(),
            state_dir: self.state_dir.clone(),
            ..ConfigOverrides::default()
        }
    }
}

#[derive(Debug, Default)]
struct ConfigOverrides {
    base_url: Option<String>,
    socket_url: Option<String>,
    session_transport: Option<String>,
    state_dir: Option<PathBuf>,
    typing_interval_ms: Option<u64>,
}

fn build_config(overrides: ConfigOverrides) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env()?;
    apply_overrides(&mut config, overrides)?;
    Ok(config)
}

/// Command-line flags win over both the environment and the defaults.
fn apply_overrides(config: &mut EngineConfig, overrides: ConfigOverrides) -> Result<()> {
    if let Some(base_url) = overrides.base_url.as_deref() {
        config.set_base_url(base_url);
    }
    if let Some(socket_url) = overrides.socket_url {
        config.socket_url = socket_url;
    }
    if let Some(raw) = overrides.session_transport.as_deref() {
        config.transport = SessionTransport::parse(raw)?;
    }
    if let Some(state_dir) = overrides.state_dir {
        config.state_dir = state_dir;
    }
    if let Some(interval) = overrides.typing_interval_ms {
        config.typing_interval_ms = interval.clamp(1, 1000);
    }
    Ok(())
}

fn open_events(config: &EngineConfig) -> Result<EventWriter> {
    fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating state dir {}", config.state_dir.display()))?;
    Ok(EventWriter::new(
        config.events_path(),
        Uuid::new_v4().to_string(),
    ))
}

/// Prints transcript changes as they happen. Bot reveals stream character
/// by character; everything else prints as whole lines.
struct TerminalTranscript;

impl TerminalTranscript {
    fn print_entry(&self, entry: &Entry) {
        match entry.kind {
            EntryKind::Welcome | EntryKind::Bot | EntryKind::Busy => {
                println!("bot: {}", entry.text);
            }
            EntryKind::User => {
                if entry.text.is_empty() {
                    println!("tú:");
                } else {
                    println!("tú: {}", entry.text);
                }
                for (position, image) in entry.images.iter().enumerate() {
                    let origin = if image.from_file { "archivo" } else { "url" };
                    println!("  imagen {} ({origin}): {}", position + 1, image.display);
                }
            }
        }
    }
}

impl TranscriptView for TerminalTranscript {
    fn entry_added(&self, entry: &Entry) {
        self.print_entry(entry);
    }

    fn entry_removed(&self, _id: u64, _kind: EntryKind) {
        // A printed line cannot be retracted from a terminal.
    }

    fn reveal_started(&self, _id: u64) {
        print!("bot: ");
        let _ = io::stdout().flush();
    }

    fn reveal_char(&self, _id: u64, ch: char) {
        print!("{ch}");
        let _ = io::stdout().flush();
    }

    fn reveal_finished(&self, _id: u64, complete: bool) {
        println!();
        if complete {
            print!("> ");
            let _ = io::stdout().flush();
        }
    }

    fn transcript_cleared(&self) {
        println!("(historial reiniciado)");
    }
}

/// Status chip and result feed of the live monitor, with the analyses-seen
/// and uptime counters shown next to each result.
struct TerminalLiveView {
    started: Instant,
    analyses: AtomicU64,
}

impl TerminalLiveView {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            analyses: AtomicU64::new(0),
        }
    }
}

impl LiveView for TerminalLiveView {
    fn status_changed(&self, state: ConnectionState) {
        println!("[estado] {}", state.status_text());
    }

    fn analysis_started(&self) {
        println!("[live] analizando...");
    }

    fn result_rendered(&self, url: &str, label: &str, confidence: f64) {
        let count = self.analyses.fetch_add(1, Ordering::SeqCst) + 1;
        println!(
            "[live] {label} ({}) · {url} · análisis {count} · activo {}",
            format_confidence(confidence),
            format_uptime(self.started.elapsed()),
        );
    }

    fn error_rendered(&self, message: &str) {
        println!("[live] {message}");
    }
}

fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let text = value?.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
