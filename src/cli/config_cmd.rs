use anyhow::Result;

use crate::cli::output::{print_json, OutputOptions};
use crate::core::config::{AppConfig, LedgerBackend};

pub fn init(opts: &OutputOptions) -> Result<()> {
    let path = AppConfig::config_path();
    if path.exists() {
        eprintln!("Config file already exists at {}", path.display());
        eprintln!("Remove it first if you want to regenerate.");
        return Ok(());
    }

    match AppConfig::starter().save() {
        Ok(path) => {
            if opts.is_json() {
                return print_json(&serde_json::json!({ "path": path }), opts);
            }
            println!("Generated config at {}", path.display());
            println!("  Ledger: local file at {}", AppConfig::default().ledger.local_path().display());
            println!("  Edit [[pricing]] entries to set per-agent credit weights.");
        }
        Err(e) => {
            eprintln!("Failed to generate config: {}", e);
            std::process::exit(1);
        }
    }
    Ok(())
}

pub fn check(opts: &OutputOptions) -> Result<()> {
    let path = AppConfig::config_path();
    if !path.exists() {
        eprintln!("No config file found at {}", path.display());
        eprintln!("Run `credmeter config init` to create one.");
        return Ok(());
    }

    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let issues = config.validate();
    if opts.is_json() {
        print_json(
            &serde_json::json!({
                "path": path,
                "valid": issues.is_empty(),
                "issues": issues,
            }),
            opts,
        )?;
    } else if issues.is_empty() {
        println!("Config is valid: {}", path.display());
        match config.ledger.backend {
            LedgerBackend::Local => {
                println!("  Ledger: local ({})", config.ledger.local_path().display())
            }
            LedgerBackend::Remote => println!(
                "  Ledger: remote ({})",
                config.ledger.url.as_deref().unwrap_or("-")
            ),
        }
        println!(
            "  Charge policy: {}, {} priced agent{}",
            config.credits.charge_policy.id(),
            config.pricing.len(),
            if config.pricing.len() == 1 { "" } else { "s" }
        );
    } else {
        eprintln!("Config issues found in {}:", path.display());
        for issue in &issues {
            eprintln!("  - {}", issue);
        }
    }
    if !issues.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
