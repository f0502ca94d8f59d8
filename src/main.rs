//! Jarvis 命令行入口
//!
//! 初始化日志、加载配置、构建 Brain，可选导入知识库目录，然后进入逐行对话循环。

use std::io::Write;

use anyhow::Context;
use jarvis::config::load_config;
use jarvis::core::BrainBuilder;
use jarvis::observability;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let brain = BrainBuilder::from_app_config(&cfg)
        .context("Failed to prepare brain")?
        .build()
        .context("Failed to build brain")?;

    if let Some(dir) = &cfg.app.knowledge_dir {
        let report = brain
            .ingest_dir(dir, &cfg.app.knowledge_glob)
            .await
            .with_context(|| format!("Failed to ingest {}", dir.display()))?;
        tracing::info!(
            documents = report.documents,
            chunks = report.chunks,
            skipped = report.skipped.len(),
            "knowledge ingested"
        );
    }

    let mut session = brain.new_session();
    println!("{} ready. Type \"exit\" to quit.", cfg.app.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("You: ");
        std::io::stdout().flush().context("Failed to flush stdout")?;
        let Some(line) = lines.next_line().await.context("Failed to read input")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }
        match brain.handle_turn(&mut session, line).await {
            Ok(reply) => println!("{}: {}", cfg.app.name, reply.text),
            Err(failure) => println!("{}: {}", cfg.app.name, failure.user_message()),
        }
    }

    brain
        .end_session(&session)
        .context("Failed to clean up session memory")?;
    Ok(())
}
