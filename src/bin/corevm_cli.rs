//! Command-line driver.
//!
//! A thin shell over the four operations described for the core pipeline:
//! `tokenize`, `parse`, `register_module`, `inspect`. Exit code 0 on
//! success, 1 on any thrown parse error or emitted error diagnostic.

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use corevm::compiler_context::{CompilerContext, CompilerOptions};
use corevm::diagnostics::{format_diagnostic, Severity};
use corevm::lexer::tokenize;
use corevm::parser::parse_module;

#[derive(Parser)]
#[command(name = "corevm-cli")]
#[command(version = "0.1.0")]
#[command(about = "Inspect and register modules for the versioned, role-secured core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: text (default) or json
    #[arg(long, short = 'o', global = true, default_value = "text", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Tokenize source, including `invalid` tokens for unrecognized characters
    Tokenize {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Parse source into a module (no registration)
    Parse {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Parse and register a module, reporting VER*/SEC* diagnostics
    Register {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Parse, register, and report on a module
    Inspect {
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Report registered function/type version chains
        #[arg(long)]
        versions: bool,

        /// Report roles, permissions, and policies
        #[arg(long)]
        security: bool,

        /// Report every accumulated diagnostic
        #[arg(long)]
        diagnostics: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Tokenize { file } => cmd_tokenize(file.clone(), cli.format),
        Commands::Parse { file } => cmd_parse(file.clone(), cli.format),
        Commands::Register { file } => cmd_register(file.clone(), cli.format),
        Commands::Inspect {
            file,
            versions,
            security,
            diagnostics,
        } => cmd_inspect(file.clone(), *versions, *security, *diagnostics, cli.format),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.format == OutputFormat::Json {
                println!(r#"{{"error": "{}"}}"#, e.replace('"', "\\\""));
            } else {
                eprintln!("{}: {}", "error".red().bold(), e);
            }
            ExitCode::FAILURE
        }
    }
}

fn cmd_tokenize(file: Option<PathBuf>, format: OutputFormat) -> Result<(), String> {
    let source = read_input(file)?;
    let tokens = tokenize(&source).map_err(|e| format!("Lex error: {}", e))?;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&tokens)
                    .map_err(|e| format!("JSON serialization failed: {}", e))?
            );
        }
        OutputFormat::Text => {
            println!("{} {} token(s)", "OK".green(), tokens.len());
            for token in &tokens {
                println!("  {:?}", token.kind);
            }
        }
    }

    Ok(())
}

fn cmd_parse(file: Option<PathBuf>, format: OutputFormat) -> Result<(), String> {
    let source = read_input(file)?;
    let module = parse_module(&source).map_err(|e| format!("Parse error: {}", e))?;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&module)
                    .map_err(|e| format!("JSON serialization failed: {}", e))?
            );
        }
        OutputFormat::Text => {
            println!("{} module '{}'", "OK".green(), module.name);
            println!("  functions:   {}", module.functions().count());
            println!("  types:       {}", module.types().count());
            println!("  roles:       {}", module.roles().count());
            println!("  permissions: {}", module.permissions().count());
            println!("  policies:    {}", module.policies().count());
        }
    }

    Ok(())
}

fn cmd_register(file: Option<PathBuf>, format: OutputFormat) -> Result<(), String> {
    let source = read_input(file)?;
    let module = parse_module(&source).map_err(|e| format!("Parse error: {}", e))?;

    let mut ctx = CompilerContext::new(CompilerOptions::default());
    ctx.register_module(&module);

    print_diagnostics(&ctx, &source, format);

    if ctx.has_errors() {
        Err("registration produced one or more error diagnostics".to_string())
    } else {
        Ok(())
    }
}

fn cmd_inspect(
    file: Option<PathBuf>,
    versions: bool,
    security: bool,
    diagnostics: bool,
    format: OutputFormat,
) -> Result<(), String> {
    let source = read_input(file)?;
    let module = parse_module(&source).map_err(|e| format!("Parse error: {}", e))?;

    let mut ctx = CompilerContext::new(CompilerOptions::default());
    ctx.register_module(&module);

    // No flags means every section.
    let (versions, security, diagnostics) = if !versions && !security && !diagnostics {
        (true, true, true)
    } else {
        (versions, security, diagnostics)
    };

    match format {
        OutputFormat::Json => {
            let mut report = serde_json::Map::new();
            if versions {
                report.insert("versions".to_string(), versions_report_json(&module, &ctx));
            }
            if security {
                report.insert("security".to_string(), security_report_json(&module));
            }
            if diagnostics {
                report.insert(
                    "diagnostics".to_string(),
                    serde_json::to_value(ctx.diagnostics.iter().collect::<Vec<_>>())
                        .map_err(|e| format!("JSON serialization failed: {}", e))?,
                );
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::Value::Object(report))
                    .map_err(|e| format!("JSON serialization failed: {}", e))?
            );
        }
        OutputFormat::Text => {
            println!("{} module '{}'", "OK".green().bold(), module.name);
            if versions {
                println!();
                println!("{}", "Versions:".cyan().bold());
                print_versions_report(&module, &ctx);
            }
            if security {
                println!();
                println!("{}", "Security:".cyan().bold());
                print_security_report(&module);
            }
            if diagnostics {
                println!();
                println!("{}", "Diagnostics:".cyan().bold());
                print_diagnostics(&ctx, &source, format);
            }
        }
    }

    if ctx.has_errors() {
        Err("registration produced one or more error diagnostics".to_string())
    } else {
        Ok(())
    }
}

fn print_versions_report(module: &corevm::Module, ctx: &CompilerContext) {
    for f in module.functions() {
        let chain = ctx.functions.chain(&f.name);
        let latest = chain.and_then(|c| c.latest());
        let latest_stable = chain.and_then(|c| c.latest_stable());
        println!(
            "  fn {} ({} version(s), latest {}, latest stable {})",
            f.name,
            chain.map(|c| c.len()).unwrap_or(0),
            latest.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
            latest_stable.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        );
    }
    for t in module.types() {
        let chain = ctx.types.chain(&t.name);
        println!(
            "  type {} ({} version(s))",
            t.name,
            chain.map(|c| c.len()).unwrap_or(0),
        );
    }
}

fn versions_report_json(module: &corevm::Module, ctx: &CompilerContext) -> serde_json::Value {
    let functions: Vec<_> = module
        .functions()
        .map(|f| {
            let chain = ctx.functions.chain(&f.name);
            serde_json::json!({
                "name": f.name,
                "version_count": chain.map(|c| c.len()).unwrap_or(0),
                "latest": chain.and_then(|c| c.latest()).map(|v| v.to_string()),
                "latest_stable": chain.and_then(|c| c.latest_stable()).map(|v| v.to_string()),
            })
        })
        .collect();
    let types: Vec<_> = module
        .types()
        .map(|t| {
            let chain = ctx.types.chain(&t.name);
            serde_json::json!({
                "name": t.name,
                "version_count": chain.map(|c| c.len()).unwrap_or(0),
            })
        })
        .collect();
    serde_json::json!({ "functions": functions, "types": types })
}

fn print_security_report(module: &corevm::Module) {
    for role in module.roles() {
        println!(
            "  role {} (parents: {:?}, permissions: {:?})",
            role.name, role.parents, role.permissions
        );
    }
    for permission in module.permissions() {
        println!(
            "  permission {} (classification: {:?})",
            permission.name, permission.classification
        );
    }
    for policy in module.policies() {
        println!("  policy {} ({} rule(s))", policy.name, policy.rules.len());
    }
}

fn security_report_json(module: &corevm::Module) -> serde_json::Value {
    let roles: Vec<_> = module
        .roles()
        .map(|r| serde_json::json!({ "name": r.name, "parents": r.parents, "permissions": r.permissions }))
        .collect();
    let permissions: Vec<_> = module
        .permissions()
        .map(|p| serde_json::json!({ "name": p.name, "classification": format!("{:?}", p.classification) }))
        .collect();
    let policies: Vec<_> = module
        .policies()
        .map(|p| serde_json::json!({ "name": p.name, "rule_count": p.rules.len() }))
        .collect();
    serde_json::json!({ "roles": roles, "permissions": permissions, "policies": policies })
}

fn print_diagnostics(ctx: &CompilerContext, source: &str, format: OutputFormat) {
    if ctx.diagnostics.is_empty() {
        if format == OutputFormat::Text {
            println!("  {} no diagnostics", "OK".green());
        }
        return;
    }

    match format {
        OutputFormat::Json => {
            let items: Vec<_> = ctx.diagnostics.iter().collect();
            println!("{}", serde_json::to_string_pretty(&items).unwrap_or_default());
        }
        OutputFormat::Text => {
            for diag in ctx.diagnostics.iter() {
                let rendered = format_diagnostic(diag, source);
                match diag.severity {
                    Severity::Error => println!("  {}", rendered.red()),
                    Severity::Warning => println!("  {}", rendered.yellow()),
                    Severity::Info | Severity::Hint => println!("  {}", rendered.dimmed()),
                }
            }
        }
    }
}

fn read_input(file: Option<PathBuf>) -> Result<String, String> {
    match file {
        Some(path) => std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read '{}': {}", path.display(), e)),
        None => {
            if atty::is(atty::Stream::Stdin) {
                return Err("No input provided. Use --file or pipe input via stdin.".to_string());
            }
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| format!("Failed to read stdin: {}", e))?;
            Ok(buffer)
        }
    }
}
