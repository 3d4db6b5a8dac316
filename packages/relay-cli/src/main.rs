use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_core::{
    chain_adapter::DefaultChainAdapterFactory,
    peers::StaticPeers,
    scheduler::{build_engine, build_gate, LoopRunner, NoOracle, ParallelLoop, RelayChains},
    transfer::{signing::builtin_message_signer, TransferStats},
    Config,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 日志级别，也可以是完整的 EnvFilter 表达式；未指定时读取 RUST_LOG，默认 info
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 执行一轮转发后退出
    Once {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 启动中继循环
    Start {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        /// 以两个并行 worker 运行
        #[arg(long)]
        parallel: bool,
    },
    /// 打印两条链上的消息计数器
    Counters {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn print_summary(config: &Config) {
    println!("Configuration is valid");
    println!("- Main chain: {} ({}) at {}", config.main_chain.name, config.main_chain.chain_id, config.main_chain.rpc_url);
    println!("  MessageProxy: {}", config.main_chain.message_proxy);
    println!("- Side chain: {} ({}) at {}", config.side_chain.name, config.side_chain.chain_id, config.side_chain.rpc_url);
    println!("  MessageProxy: {}", config.side_chain.message_proxy);
    println!("- Loop:");
    println!("  - Period: {}s", config.run_loop.period_seconds);
    println!(
        "  - Steps: oracle={} m2s={} s2m={} s2s={}",
        config.run_loop.enable_oracle,
        config.run_loop.enable_m2s,
        config.run_loop.enable_s2m,
        config.run_loop.enable_s2s && config.s2s.enabled
    );
    println!("  - Parallel: {}", config.run_loop.parallel);
    println!(
        "- Time framing: node {} of {}, frame {}s",
        config.time_framing.node_number, config.time_framing.nodes_count, config.time_framing.frame_seconds
    );
    println!("- PWA enabled: {}", config.pwa.enabled);
    println!("- S2S peers: {}", config.s2s.peers.len());
    println!("- Message signing enabled: {}", config.signing.enabled);
}

async fn print_counters(config: &Config) -> Result<()> {
    let chains = RelayChains::connect(config, &DefaultChainAdapterFactory).await?;
    let main = &chains.main;
    let side = &chains.side;

    let m2s_out = main.proxy.outgoing_messages_counter(&side.name).await?;
    let m2s_in = side.proxy.incoming_messages_counter(&main.name).await?;
    println!("{} -> {}: outgoing {}, incoming {}, pending {}", main.name, side.name, m2s_out, m2s_in, m2s_out.saturating_sub(m2s_in));

    let s2m_out = side.proxy.outgoing_messages_counter(&main.name).await?;
    let s2m_in = main.proxy.incoming_messages_counter(&side.name).await?;
    println!("{} -> {}: outgoing {}, incoming {}, pending {}", side.name, main.name, s2m_out, s2m_in, s2m_out.saturating_sub(s2m_in));
    Ok(())
}

async fn build_runner(config: &Config) -> Result<LoopRunner> {
    let chains = RelayChains::connect(config, &DefaultChainAdapterFactory).await?;
    let signer = builtin_message_signer(&config.signing)?;
    let engine = build_engine(
        config,
        TransferStats::new(),
        signer,
        Arc::new(StaticPeers::new(config.s2s.peers.clone())),
        Arc::new(DefaultChainAdapterFactory),
    );
    Ok(LoopRunner::new(Arc::new(engine), chains, config).with_gate(build_gate(config)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    match cli.command {
        Commands::ValidateConfig { config } => {
            info!("Validating config file: {:?}", config);
            let config = Config::load(config)?;
            print_summary(&config);
            Ok(())
        }
        Commands::Once { config } => {
            info!("Running a single transfer loop with config file: {:?}", config);
            let config = Config::load(config)?;
            let runner = build_runner(&config).await?;
            if !runner.single_transfer_loop().await {
                error!("Transfer loop finished with failures");
                std::process::exit(1);
            }
            info!("Transfer loop finished");
            Ok(())
        }
        Commands::Start { config, parallel } => {
            info!("Starting relay loop with config file: {:?}", config);
            let config = Config::load(config)?;
            if parallel || config.run_loop.parallel {
                let chains = RelayChains::connect(&config, &DefaultChainAdapterFactory).await?;
                let signer = builtin_message_signer(&config.signing)?;
                let gate = build_gate(&config);
                let workers = ParallelLoop::new(
                    config,
                    chains,
                    TransferStats::new(),
                    signer,
                    Arc::new(DefaultChainAdapterFactory),
                    gate,
                    Arc::new(NoOracle),
                );
                if let Err(e) = workers.run().await {
                    error!("Relay loop exited with error: {}", e);
                    return Err(e.into());
                }
            } else {
                let runner = build_runner(&config).await?;
                info!("Relay initialized, entering loop");
                runner.run_forever().await;
            }
            Ok(())
        }
        Commands::Counters { config } => {
            let config = Config::load(config)?;
            print_counters(&config).await
        }
    }
}
