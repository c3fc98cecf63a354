use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use overlay_translator::{
    Applied, Completion, DocumentSession, FileRasterizer, OverlayId, OverlayState,
    SelectionPipeline, Settings, Stage,
};

#[derive(Parser, Debug)]
#[command(
    name = "overlay-translator",
    version,
    about = "Replace a selected region of a scanned page with its translation"
)]
struct Cli {
    /// Document to open (PDF or raster image)
    #[arg(short = 'd', long = "document")]
    document: Option<PathBuf>,

    /// Page index, starting at 0
    #[arg(short = 'p', long = "page", default_value_t = 0)]
    page: usize,

    /// Zoom the selection was drawn at (0.2 - 3.0)
    #[arg(short = 'z', long = "zoom", default_value_t = 1.0)]
    zoom: f64,

    /// Selection in view coordinates: x,y,w,h
    #[arg(long = "rect")]
    rect: Option<String>,

    /// Write the inpainted page raster to this file
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Target language (overrides settings)
    #[arg(short = 'l', long = "lang")]
    lang: Option<String>,

    /// Source language (overrides settings)
    #[arg(short = 'L', long = "source-lang")]
    source_lang: Option<String>,

    /// Recognition language(s), e.g. jpn or jpn+eng
    #[arg(long = "ocr-lang")]
    ocr_lang: Option<String>,

    /// Preprocessing stages to enable (deskew, denoise, contrast, threshold, sharpen)
    #[arg(short = 'P', long = "preprocess", value_delimiter = ',')]
    preprocess: Vec<String>,

    /// Grow the overlay so its text fits
    #[arg(long = "fit")]
    fit: bool,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,

    /// Interactive mode
    #[arg(short = 'i', long = "interactive")]
    interactive: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    overlay_translator::logging::init(cli.verbose)?;
    if cli.interactive {
        return run_interactive(cli).await;
    }

    let document = cli
        .document
        .clone()
        .ok_or_else(|| anyhow!("--document is required (or use -i)"))?;
    let rect = cli
        .rect
        .as_deref()
        .ok_or_else(|| anyhow!("--rect is required"))?;
    let config = overlay_translator::Config {
        document,
        page: cli.page,
        zoom: cli.zoom,
        rect: overlay_translator::parse_rect(rect)?,
        output: cli.output.clone(),
        settings_path: cli.read_settings.clone(),
        source_lang: cli.source_lang.clone(),
        target_lang: cli.lang.clone(),
        ocr_lang: cli.ocr_lang.clone(),
        preprocess: parse_stages(&cli.preprocess)?,
        fit: cli.fit,
    };

    let output = overlay_translator::run(config).await?;
    println!("{}", output);
    Ok(())
}

fn parse_stages(values: &[String]) -> Result<Vec<Stage>> {
    values
        .iter()
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.parse::<Stage>().map_err(|err| anyhow!(err)))
        .collect()
}

struct InteractiveState {
    session: DocumentSession,
    pipeline: SelectionPipeline,
    rasterizer: FileRasterizer,
    tx: UnboundedSender<Completion>,
}

impl InteractiveState {
    fn new(cli: &Cli, tx: UnboundedSender<Completion>) -> Result<Self> {
        let mut settings =
            overlay_translator::settings::load_settings(cli.read_settings.as_deref().map(Path::new))?;
        apply_cli_overrides(&mut settings, cli)?;
        overlay_translator::resolve_ocr_language(&mut settings);
        Ok(Self {
            session: DocumentSession::new()
                .with_font_size(settings.font_size)
                .with_preprocess(settings.preprocess),
            pipeline: overlay_translator::build_pipeline(&settings, overlay_translator::openai_key()),
            rasterizer: FileRasterizer::default().with_dpi(settings.dpi),
            tx,
        })
    }

    fn open(&mut self, path: &Path) -> Result<()> {
        self.session.open_path(path, &self.rasterizer)?;
        println!(
            "opened {} ({} pages)",
            path.display(),
            self.session.page_count()
        );
        Ok(())
    }

    fn select(&mut self, rect: &str) -> Result<()> {
        let view = overlay_translator::parse_rect(rect)?;
        let job = self.session.begin_selection(view)?;
        let id = job.ticket.overlay;
        let handle = self.pipeline.spawn(job, self.tx.clone());
        self.session.track(id, handle.abort_handle());
        println!("overlay {} queued", id);
        Ok(())
    }
}

fn apply_cli_overrides(settings: &mut Settings, cli: &Cli) -> Result<()> {
    if let Some(lang) = cli.lang.as_deref().filter(|value| !value.trim().is_empty()) {
        settings.translation.target_lang = lang.trim().to_string();
    }
    if let Some(lang) = cli.source_lang.as_deref().filter(|value| !value.trim().is_empty()) {
        settings.translation.source_lang = lang.trim().to_string();
    }
    if let Some(lang) = cli.ocr_lang.as_deref().filter(|value| !value.trim().is_empty()) {
        settings.ocr.language = lang.trim().to_string();
    }
    for stage in parse_stages(&cli.preprocess)? {
        settings.preprocess = settings.preprocess.with(stage, true);
    }
    Ok(())
}

async fn run_interactive(cli: Cli) -> Result<()> {
    let (tx, mut rx) = unbounded_channel();
    let mut state = InteractiveState::new(&cli, tx)?;
    if let Some(document) = cli.document.as_deref() {
        state.open(document)?;
        state.session.show_page(cli.page)?;
        state.session.set_zoom(cli.zoom);
    }
    println!("Interactive mode. Use /quit or /exit to finish.");
    println!("Type /help to see available commands.");
    prompt()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let input = line.trim();
                if !input.is_empty() {
                    match handle_interactive_command(input, &mut state) {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(err) => eprintln!("error: {:#}", err),
                    }
                }
                prompt()?;
            }
            Some(completion) = rx.recv() => {
                if report_completion(state.session.apply_completion(completion), &state.session) {
                    prompt()?;
                }
            }
        }
    }
    state.session.close();
    Ok(())
}

fn prompt() -> Result<()> {
    print!("> ");
    io::stdout().flush()?;
    Ok(())
}

/// Prints what a completion did. Returns true when something was printed.
fn report_completion(applied: Applied, session: &DocumentSession) -> bool {
    match applied {
        Applied::Placed(id) => {
            let text = session
                .overlays()
                .get(id)
                .map(|overlay| overlay.text().to_string())
                .unwrap_or_default();
            println!("\noverlay {} placed: {}", id, text);
            true
        }
        Applied::Aborted { overlay, error } => {
            println!("\noverlay {} dropped: {}", overlay, error);
            true
        }
        Applied::Progress(..) | Applied::Discarded(_) => false,
    }
}

fn handle_interactive_command(input: &str, state: &mut InteractiveState) -> Result<bool> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return Err(anyhow!("commands start with '/'; try /help"));
    }
    let (command, arg) = trimmed
        .split_once(char::is_whitespace)
        .map(|(command, arg)| (command, arg.trim()))
        .unwrap_or((trimmed, ""));

    match command {
        "/quit" | "/exit" => return Ok(true),
        "/help" => print_interactive_help(),
        "/open" => {
            if arg.is_empty() {
                return Err(anyhow!("usage: /open <path>"));
            }
            state.open(Path::new(arg))?;
        }
        "/close" => {
            state.session.close();
            println!("document closed");
        }
        "/page" => {
            if !arg.is_empty() {
                let index = arg.parse::<usize>().map_err(|_| anyhow!("invalid page '{}'", arg))?;
                state.session.show_page(index)?;
            }
            println!(
                "page {}/{}",
                state.session.page_index(),
                state.session.page_count()
            );
        }
        "/zoom" => {
            let zoom = match arg {
                "" => state.session.space().zoom(),
                "+" => state.session.zoom_by(overlay_translator::geometry::ZOOM_STEP),
                "-" => state.session.zoom_by(-overlay_translator::geometry::ZOOM_STEP),
                value => {
                    let zoom = value.parse::<f64>().map_err(|_| anyhow!("invalid zoom '{}'", value))?;
                    state.session.set_zoom(zoom)
                }
            };
            println!("zoom: {:.2}", zoom);
        }
        "/scroll" => {
            let [x, y] = parse_numbers::<2>(arg, "/scroll <x> <y>")?;
            state.session.set_scroll(x, y);
        }
        "/select" => state.select(arg)?,
        "/move" => {
            let (id, rest) = split_id(arg, "/move <id> <dx> <dy>")?;
            let [dx, dy] = parse_numbers::<2>(rest, "/move <id> <dx> <dy>")?;
            let anchor = state.session.move_overlay(id, dx, dy)?;
            println!("overlay {} at {:?}", id, anchor);
        }
        "/resize" => {
            let (id, rest) = split_id(arg, "/resize <id> <w> <h>")?;
            let [w, h] = parse_numbers::<2>(rest, "/resize <id> <w> <h>")?;
            let anchor = state.session.resize_overlay(id, w, h)?;
            println!("overlay {} at {:?}", id, anchor);
        }
        "/fit" => {
            let (id, _) = split_id(arg, "/fit <id>")?;
            let anchor = state.session.overlays_mut().resize_to_fit(id)?;
            println!("overlay {} at {:?}", id, anchor);
        }
        "/edit" => {
            let (id, text) = split_id(arg, "/edit <id> <text>")?;
            let overlays = state.session.overlays_mut();
            let was_placed = overlays.get(id)?.state() == OverlayState::Placed;
            if was_placed {
                overlays.focus(id)?;
            }
            overlays.set_text(id, text.replace("\\n", "\n"))?;
            if was_placed {
                overlays.blur(id)?;
            }
        }
        "/focus" => {
            let (id, _) = split_id(arg, "/focus <id>")?;
            state.session.overlays_mut().focus(id)?;
        }
        "/blur" => {
            let (id, _) = split_id(arg, "/blur <id>")?;
            state.session.overlays_mut().blur(id)?;
        }
        "/delete" => {
            let (id, _) = split_id(arg, "/delete <id>")?;
            state.session.delete_overlay(id)?;
            println!("overlay {} deleted", id);
        }
        "/font" => {
            let parts = arg.split_whitespace().collect::<Vec<_>>();
            match parts.as_slice() {
                [] => println!("font size: {}", state.session.overlays().font_size()),
                [size] => {
                    let size = parse_font_size(size)?;
                    let applied = state.session.overlays_mut().set_font_size_all(size);
                    println!("font size: {}", applied);
                }
                [id, size] => {
                    let id = id.parse::<OverlayId>().map_err(|err| anyhow!(err))?;
                    let size = parse_font_size(size)?;
                    let applied = state.session.overlays_mut().set_font_size(id, size)?;
                    println!("overlay {} font size: {}", id, applied);
                }
                _ => return Err(anyhow!("usage: /font [<id>] <size>")),
            }
        }
        "/preprocess" => {
            let mut config = state.session.preprocess();
            if !arg.is_empty() {
                let (stage, toggle) = arg.split_once(char::is_whitespace).unwrap_or((arg, ""));
                let stage = stage.parse::<Stage>().map_err(|err| anyhow!(err))?;
                let enabled = parse_toggle(toggle, config.enabled(stage))?;
                config = config.with(stage, enabled);
                state.session.set_preprocess(config);
            }
            let stages = config
                .enabled_stages()
                .iter()
                .map(Stage::as_str)
                .collect::<Vec<_>>();
            if stages.is_empty() {
                println!("preprocess: off");
            } else {
                println!("preprocess: {}", stages.join(" -> "));
            }
        }
        "/lang" => {
            if !arg.is_empty() {
                state.pipeline.set_target_lang(arg);
            }
            println!("lang: {}", state.pipeline.target_lang());
        }
        "/list" => println!("{}", overlay_translator::format_overlays(&state.session)?),
        "/save" => {
            if arg.is_empty() {
                return Err(anyhow!("usage: /save <path>"));
            }
            state.session.current_page()?.save_current(Path::new(arg))?;
            println!("saved {}", arg);
        }
        "/status" => {
            println!("in flight: {}", state.session.in_flight());
            println!(
                "providers: {}",
                state.pipeline.chain().providers().join(", ")
            );
            for (name, reason) in state.pipeline.chain().disabled_providers() {
                println!("disabled: {} ({})", name, reason);
            }
            if state.pipeline.cascade().is_disabled() {
                println!("recognition: disabled");
            }
        }
        other => eprintln!("unknown command: {}", other),
    }
    Ok(false)
}

fn split_id<'a>(arg: &'a str, usage: &str) -> Result<(OverlayId, &'a str)> {
    let (id, rest) = arg.split_once(char::is_whitespace).unwrap_or((arg, ""));
    if id.is_empty() {
        return Err(anyhow!("usage: {}", usage));
    }
    let id = id.parse::<OverlayId>().map_err(|err| anyhow!(err))?;
    Ok((id, rest.trim()))
}

fn parse_numbers<const N: usize>(arg: &str, usage: &str) -> Result<[f64; N]> {
    let values = arg
        .split([',', ' '])
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| anyhow!("usage: {}", usage))?;
    values
        .try_into()
        .map_err(|_| anyhow!("usage: {}", usage))
}

fn parse_font_size(value: &str) -> Result<f32> {
    value
        .parse::<f32>()
        .map_err(|_| anyhow!("invalid font size '{}'", value))
}

fn parse_toggle(arg: &str, current: bool) -> Result<bool> {
    let value = arg.trim();
    if value.is_empty() {
        return Ok(!current);
    }
    match value.to_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(anyhow!("expected on/off/true/false/1/0")),
    }
}

fn print_interactive_help() {
    println!("Commands:");
    println!("  /quit, /exit                 Exit interactive mode");
    println!("  /open <path>                 Open a PDF or image");
    println!("  /close                       Close the document and drop its overlays");
    println!("  /page [n]                    Show or switch the page");
    println!("  /zoom [z|+|-]                Show or set the zoom (0.2 - 3.0)");
    println!("  /scroll <x> <y>              Set the view scroll offset");
    println!("  /select <x,y,w,h>            Translate a view-space selection");
    println!("  /move <id> <dx> <dy>         Drag an overlay by a view-space delta");
    println!("  /resize <id> <w> <h>         Resize an overlay in view units");
    println!("  /fit <id>                    Grow an overlay to fit its text");
    println!("  /edit <id> <text>            Replace an overlay's text (\\n for breaks)");
    println!("  /focus <id>, /blur <id>      Enter or leave editing");
    println!("  /delete <id>                 Remove an overlay and restore the page");
    println!("  /font [<id>] <size>          Set the font size of one or all overlays");
    println!("  /preprocess [stage [on|off]] Show or toggle a preprocessing stage");
    println!("  /lang <code>                 Set the target language");
    println!("  /list                        Print the current page's overlays as JSON");
    println!("  /save <path>                 Write the current page raster");
    println!("  /status                      Show pending work and disabled backends");
}
