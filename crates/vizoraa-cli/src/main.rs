use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use uuid::Uuid;
use vizoraa_contracts::analysis::{AnalysisResult, GoalReport};
use vizoraa_contracts::charts::{ChartOutcome, RenderableChart};
use vizoraa_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use vizoraa_contracts::columns::{is_supported_dataset, sniff_columns};
use vizoraa_contracts::events::EventLog;
use vizoraa_contracts::export::{write_rows_csv, DEFAULT_EXPORT_FILE_NAME};
use vizoraa_contracts::session::{ActiveFile, Session, StagedFile, SubmitError};
use vizoraa_engine::{
    export_goal_rows, resolve_backend, save_chart_image, AnalysisBackend, AnalysisEngine,
};

#[derive(Debug, Parser)]
#[command(name = "vizoraa", version, about = "Vizoraa analysis client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Analyze(AnalyzeArgs),
    Query(QueryArgs),
    Columns(ColumnsArgs),
    Export(ExportArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = "vizoraa-out")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    instruction: Option<String>,
    #[arg(long, default_value = "vizoraa-out")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Debug, Parser)]
struct QueryArgs {
    #[arg(long)]
    file_id: String,
    #[arg(long)]
    instruction: String,
    #[arg(long, default_value = "vizoraa-out")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Debug, Parser)]
struct ColumnsArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    local: bool,
    #[arg(long, default_value = "vizoraa-out")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    backend: Option<String>,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[arg(long)]
    result: PathBuf,
    #[arg(long, default_value = "vizoraa-out")]
    out: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("vizoraa error: {err:#}");
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
        Command::Analyze(args) => run_analyze(args),
        Command::Query(args) => run_query(args),
        Command::Columns(args) => run_columns(args),
        Command::Export(args) => run_export(args),
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let engine = build_engine(
        &args.out,
        args.events.as_deref(),
        args.api_base.as_deref(),
        args.backend.as_deref(),
    )?;
    let mut session = Session::new();

    let stdin = io::stdin();
    let mut line = String::new();

    println!("Vizoraa chat started. Type /help for commands.");
    println!(
        "Backend: {} | artifacts under {}",
        engine.backend().name(),
        engine.out_dir().display()
    );

    loop {
        print!("> ");
        io::stdout().flush()?;

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
            continue;
        }

        match intent.action.as_str() {
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                println!("Anything else is sent to the analyst as a query.");
            }
            "attach_file" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path"))
                else {
                    println!("/attach needs a file path.");
                    continue;
                };
                let path = PathBuf::from(path);
                if !is_supported_dataset(&path) {
                    println!("Please upload a valid CSV, JSON, or Excel file.");
                    continue;
                }
                let staged = match StagedFile::from_path(&path) {
                    Ok(staged) => staged,
                    Err(err) => {
                        println!("Attach failed: {err:#}");
                        continue;
                    }
                };
                let columns = match sniff_columns(&path) {
                    Ok(columns) => columns,
                    Err(err) => {
                        println!("Note: {err:#}.");
                        Vec::new()
                    }
                };
                engine.emit_event(
                    "file_staged",
                    json!({
                        "name": staged.name,
                        "media_type": staged.media_type,
                        "size": staged.size_label,
                        "columns": columns.len(),
                    }),
                )?;
                println!(
                    "Staged {} ({}, {})",
                    staged.name, staged.media_type, staged.size_label
                );
                if !columns.is_empty() {
                    println!("COLUMNS:\n{}", columns.join(", "));
                }
                session.stage_file(staged, columns);
            }
            "analyze_staged" => {
                submit_and_render(&engine, &mut session, "");
            }
            "select_document" => {
                let Some(doc_id) = value_as_non_empty_string(intent.command_args.get("doc_id"))
                else {
                    println!("/use needs a document id.");
                    continue;
                };
                match session.select_document(&doc_id) {
                    Some(document) => {
                        println!("Active document: {} ({})", document.name, document.file_id);
                    }
                    None => println!("No document with id {doc_id}."),
                }
            }
            "remove_document" => {
                let Some(doc_id) = value_as_non_empty_string(intent.command_args.get("doc_id"))
                else {
                    println!("/remove needs a document id.");
                    continue;
                };
                let was_active = matches!(
                    session.active(),
                    ActiveFile::Active { file_id, .. } if *file_id == doc_id
                );
                match session.remove_document(&doc_id) {
                    Some(document) => {
                        engine.emit_event(
                            "document_removed",
                            json!({
                                "file_id": document.file_id,
                                "name": document.name,
                            }),
                        )?;
                        println!("Removed {} ({}).", document.name, document.file_id);
                        if was_active {
                            println!("No active document now. /attach a file or /use another one.");
                        }
                    }
                    None => println!("No document with id {doc_id}."),
                }
            }
            "list_documents" => {
                if session.documents().next().is_none() {
                    println!("No documents yet. /attach a file, then /analyze.");
                    continue;
                }
                let active_id = match session.active() {
                    ActiveFile::Active { file_id, .. } => Some(file_id.clone()),
                    _ => None,
                };
                println!("DOCUMENTS:");
                for document in session.documents() {
                    let marker = if active_id.as_deref() == Some(document.file_id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{marker} {}  {} ({}, {})",
                        document.file_id, document.name, document.size_label, document.uploaded_at
                    );
                    if let Some(summary) = &document.summary {
                        println!("    {summary}");
                    }
                }
            }
            "show_columns" => {
                if session.columns().is_empty() {
                    println!("No columns cached. /attach a file or run an analysis first.");
                } else {
                    println!("COLUMNS:\n{}", session.columns().join(", "));
                }
            }
            "show_summary" => match session.last_result() {
                Some(result) => render_summary_block(result),
                None => println!("No analysis yet."),
            },
            "export_rows" => {
                let Some(result) = session.last_result() else {
                    println!("No analysis to export yet.");
                    continue;
                };
                let dir = match value_as_non_empty_string(intent.command_args.get("path")) {
                    Some(path) => PathBuf::from(path),
                    None => engine.out_dir().to_path_buf(),
                };
                match export_goal_rows(result, &dir) {
                    Ok(written) if written.is_empty() => println!("No plotted rows to export."),
                    Ok(written) => {
                        for path in &written {
                            println!("Exported {}", path.display());
                        }
                    }
                    Err(err) => println!("Export failed: {err:#}"),
                }
            }
            "query" => {
                let Some(prompt) = intent.prompt.clone().filter(|prompt| !prompt.is_empty())
                else {
                    continue;
                };
                submit_and_render(&engine, &mut session, &prompt);
            }
            _ => match value_as_non_empty_string(intent.command_args.get("command")) {
                Some(command) => println!("Unknown command: /{command}"),
                None => println!("Unknown command. Type /help for the list."),
            },
        }
    }

    engine.emit_event(
        "chat_closed",
        json!({
            "entries": session.entries().len(),
            "documents": session.documents().count(),
        }),
    )?;
    println!("Session ended.");
    Ok(())
}

fn submit_and_render(engine: &AnalysisEngine, session: &mut Session, instruction: &str) {
    match engine.submit(session, instruction) {
        Ok(report) => {
            if !report.reconciled {
                println!("Duplicate result {} ignored.", report.result.result_id);
                return;
            }
            println!("{}", report.result.status_line());
            render_result(engine, &report.result);
            println!("Raw result saved to {}", report.raw_path.display());
        }
        Err(err) => match err.downcast_ref::<SubmitError>() {
            Some(validation) => println!("{validation}"),
            None => println!("Analysis failed: {err:#}"),
        },
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let engine = build_engine(
        &args.out,
        args.events.as_deref(),
        args.api_base.as_deref(),
        args.backend.as_deref(),
    )?;
    let mut session = Session::new();
    let staged = StagedFile::from_path(&args.file)?;
    let columns = sniff_columns(&args.file).unwrap_or_default();
    session.stage_file(staged, columns);

    let report = engine.submit(&mut session, args.instruction.as_deref().unwrap_or(""))?;
    println!("{}", report.result.status_line());
    render_result(&engine, &report.result);
    if let Some(file_id) = &report.result.file_id {
        println!("File id {file_id} (follow up with `vizoraa query --file-id {file_id}`).");
    }
    println!("Raw result saved to {}", report.raw_path.display());
    Ok(0)
}

fn run_query(args: QueryArgs) -> Result<i32> {
    let engine = build_engine(
        &args.out,
        args.events.as_deref(),
        args.api_base.as_deref(),
        args.backend.as_deref(),
    )?;
    let mut session = Session::new();
    session.activate_remote(&args.file_id);

    let report = engine.submit(&mut session, &args.instruction)?;
    println!("{}", report.result.status_line());
    render_result(&engine, &report.result);
    println!("Raw result saved to {}", report.raw_path.display());
    Ok(0)
}

fn run_columns(args: ColumnsArgs) -> Result<i32> {
    if args.local {
        let columns = sniff_columns(&args.file)?;
        print_columns(&columns);
        return Ok(0);
    }

    let engine = build_engine(
        &args.out,
        args.events.as_deref(),
        args.api_base.as_deref(),
        args.backend.as_deref(),
    )?;
    let extract = engine.backend().extract_columns(&args.file)?;
    engine.emit_event(
        "columns_extracted",
        json!({
            "filename": extract.filename,
            "columns": extract.columns.len(),
        }),
    )?;
    if !extract.filename.is_empty() {
        println!("FILE: {}", extract.filename);
    }
    print_columns(&extract.columns);
    Ok(0)
}

fn run_export(args: ExportArgs) -> Result<i32> {
    let raw = read_json_value(&args.result)
        .with_context(|| format!("reading analysis result {}", args.result.display()))?;
    let result = AnalysisResult::from_value(&raw);

    let written = export_goal_rows(&result, &args.out)?;
    for path in &written {
        println!("Exported {}", path.display());
    }
    if written.is_empty() {
        println!("No plotted rows in {}.", args.result.display());
        return Ok(0);
    }
    if let Some(rows) = first_plotted_rows(&result) {
        let path = args.out.join(DEFAULT_EXPORT_FILE_NAME);
        if write_rows_csv(&rows, &path)? {
            println!("Exported {}", path.display());
        }
    }
    Ok(0)
}

fn build_engine(
    out: &Path,
    events: Option<&Path>,
    api_base: Option<&str>,
    backend: Option<&str>,
) -> Result<AnalysisEngine> {
    let events_path = events
        .map(Path::to_path_buf)
        .unwrap_or_else(|| out.join("events.jsonl"));
    let backend = resolve_backend(backend, api_base)?;
    let events = EventLog::new(events_path, Uuid::new_v4().to_string());
    Ok(AnalysisEngine::new(backend, events, out))
}

fn render_result(engine: &AnalysisEngine, result: &AnalysisResult) {
    render_header(result);
    if !result.personas.is_empty() {
        let names: Vec<&str> = result
            .personas
            .iter()
            .map(|persona| persona.name.as_str())
            .collect();
        println!("PERSONAS: {}", names.join(", "));
    }
    let reports = result.goal_reports();
    if reports.is_empty() {
        println!("No analysis goals in this result.");
        return;
    }
    println!("GOALS:");
    for (index, report) in reports.iter().enumerate() {
        render_goal(engine, index, report);
    }
}

fn render_header(result: &AnalysisResult) {
    let summary = result.summary_text.trim();
    if !summary.is_empty() {
        println!("SUMMARY:\n{summary}");
    }
    if let Some(persona) = &result.selected_persona {
        match &persona.rationale {
            Some(rationale) => println!("PERSONA: {} ({rationale})", persona.name),
            None => println!("PERSONA: {}", persona.name),
        }
    }
}

fn render_summary_block(result: &AnalysisResult) {
    if result.summary_text.trim().is_empty() && result.selected_persona.is_none() {
        println!("The last result has no summary text.");
    } else {
        render_header(result);
    }
    let key_points = result.key_points();
    if !key_points.is_empty() {
        println!("KEY POINTS:");
        for point in &key_points {
            println!("- {point}");
        }
    }
}

fn render_goal(engine: &AnalysisEngine, index: usize, report: &GoalReport) {
    let number = index + 1;
    if report.question.is_empty() {
        println!("{number}. (unnamed goal)");
    } else {
        println!("{number}. {}", report.question);
    }
    if !report.visualization.is_empty() {
        println!("   suggested: {}", report.visualization);
    }
    match &report.outcome {
        ChartOutcome::Empty => println!("   no chart for this goal"),
        ChartOutcome::Failed(failure) => println!("   chart failed: {failure}"),
        ChartOutcome::Rendered(RenderableChart::Image { source }) => {
            match save_chart_image(engine.out_dir(), index, source) {
                Ok(saved) if saved.width > 0 => println!(
                    "   chart image: {} ({}x{} px)",
                    saved.path.display(),
                    saved.width,
                    saved.height
                ),
                Ok(saved) => println!("   chart image: {}", saved.path.display()),
                Err(err) => println!("   chart image unusable: {err:#}"),
            }
        }
        ChartOutcome::Rendered(chart) => println!("   {}", describe_chart(chart)),
    }
    if !report.rows.is_empty() {
        println!("   rows: {}", report.rows.len());
    }
}

fn describe_chart(chart: &RenderableChart) -> String {
    match chart {
        RenderableChart::Bar {
            title,
            label,
            labels,
            values,
        }
        | RenderableChart::Line {
            title,
            label,
            labels,
            values,
        }
        | RenderableChart::Pie {
            title,
            label,
            labels,
            values,
        } => {
            let name = title.as_deref().unwrap_or(label.as_str());
            let preview: Vec<String> = labels
                .iter()
                .zip(values)
                .take(4)
                .map(|(label, value)| format!("{label}={value}"))
                .collect();
            let more = if values.len() > preview.len() { ", …" } else { "" };
            format!(
                "{} chart '{}': {} points [{}{}]",
                chart.kind(),
                name,
                values.len(),
                preview.join(", "),
                more
            )
        }
        RenderableChart::Scatter {
            title,
            label,
            points,
        } => {
            let name = title.as_deref().unwrap_or(label.as_str());
            let preview: Vec<String> = points
                .iter()
                .take(4)
                .map(|(x, y)| format!("({x}, {y})"))
                .collect();
            let more = if points.len() > preview.len() { ", …" } else { "" };
            format!(
                "scatter chart '{}': {} points [{}{}]",
                name,
                points.len(),
                preview.join(", "),
                more
            )
        }
        RenderableChart::Image { .. } => "raster chart".to_string(),
    }
}

fn print_columns(columns: &[String]) {
    if columns.is_empty() {
        println!("No columns detected.");
    } else {
        println!("COLUMNS:\n{}", columns.join(", "));
    }
}

fn first_plotted_rows(result: &AnalysisResult) -> Option<Vec<Map<String, Value>>> {
    result
        .goal_reports()
        .into_iter()
        .map(|report| report.rows)
        .find(|rows| !rows.is_empty())
}

fn read_json_value(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let text = value?.as_str()?.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
