//! Interface de terminal do MVPForge — spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`PipelineProgress`] acompanha visualmente
//! a execução de um pipeline no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{Mvp, MvpState, StageAttempt};

/// Indicador visual de progresso para a execução de um pipeline.
///
/// Exibe um spinner animado durante o processamento e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e retomada (amarelo).
pub struct PipelineProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    // Estilo verde para mensagens de sucesso.
    green: Style,
    // Estilo vermelho para mensagens de falha.
    red: Style,
    // Estilo amarelo para avisos.
    yellow: Style,
}

impl PipelineProgress {
    /// Inicia o spinner com o nome do MVP e retorna a instância de progresso.
    pub fn start(name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(format!("CREATED: {name}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a mensagem do spinner para refletir o estado atual.
    #[allow(dead_code)]
    pub fn update_state(&self, state: MvpState) {
        self.pb.set_message(format!("{state}"));
    }

    /// Finaliza o spinner e exibe o resultado final do pipeline.
    pub fn complete(&self, mvp: &Mvp) {
        self.pb.finish_and_clear();
        match mvp.status {
            MvpState::Completed => {
                println!(
                    "  {} {} completed (${:.2}, {} tokens)",
                    self.green.apply_to("✓"),
                    mvp.name,
                    mvp.total_cost_estimate,
                    mvp.total_token_usage
                );
            }
            MvpState::Failed => {
                let stage = mvp.last_error_stage.as_deref().unwrap_or("unknown");
                println!(
                    "  {} {} failed at {stage}",
                    self.red.apply_to("✗"),
                    mvp.name
                );
            }
            other => {
                println!(
                    "  {} {} parked in {other} awaiting recovery",
                    self.yellow.apply_to("↻"),
                    mvp.name
                );
            }
        }
    }

    /// Imprime o registro do MVP formatado em JSON com estilo colorido.
    pub fn print_record(&self, mvp: &Mvp) {
        let status_style = match mvp.status {
            MvpState::Completed => &self.green,
            MvpState::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", status_style.apply_to("─── MVP Record ───"));
        println!("{}", serde_json::to_string_pretty(mvp).unwrap_or_default());
    }

    /// Imprime o histórico de tentativas de estágio, ordenado por início.
    pub fn print_attempts(&self, attempts: &[StageAttempt]) {
        if attempts.is_empty() {
            return;
        }
        println!();
        println!("─── Stage Attempts ───");
        for attempt in attempts {
            let duration = attempt
                .duration_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<14} {:<10} attempt {} · {duration} · ${:.4} · {} tokens",
                attempt.stage,
                format!("{:?}", attempt.status).to_lowercase(),
                attempt.attempt_number,
                attempt.cost_estimate,
                attempt.token_usage
            );
        }
    }
}
