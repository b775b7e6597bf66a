//! Interface de linha de comando do MVPForge baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status,
//! resume) e flags globais (--max-cost, --max-retries).

use clap::{Parser, Subcommand};

/// MVPForge — orquestrador de pipeline autônomo de construção de MVPs.
#[derive(Debug, Parser)]
#[command(name = "mvpforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Teto de custo acumulado por MVP em USD (sobrepõe a configuração).
    #[arg(long, global = true)]
    pub max_cost: Option<f64>,

    /// Número máximo de retentativas do pipeline antes de falhar.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria um MVP e executa o pipeline completo de estágios.
    Run {
        /// Nome do MVP a construir.
        name: String,

        /// Resumo livre da ideia inicial.
        #[arg(long)]
        summary: Option<String>,
    },

    /// Mostra a configuração ativa e a sequência de estágios.
    Status,

    /// Retoma pipelines interrompidos em estados não-terminais.
    Resume,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["mvpforge", "run", "FitTrack", "--summary", "track workouts"]);
        match cli.command {
            Command::Run { name, summary } => {
                assert_eq!(name, "FitTrack");
                assert_eq!(summary.as_deref(), Some("track workouts"));
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "mvpforge",
            "--max-cost",
            "5.0",
            "--max-retries",
            "2",
            "status",
        ]);
        assert_eq!(cli.max_cost, Some(5.0));
        assert_eq!(cli.max_retries, Some(2));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn cli_parses_resume_subcommand() {
        let cli = Cli::parse_from(["mvpforge", "resume"]);
        assert!(matches!(cli.command, Command::Resume));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
