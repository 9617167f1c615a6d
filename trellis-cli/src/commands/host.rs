//! Host command handlers
//!
//! Handles host inspection commands: GPU inventory and a system overview.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use trellis_client::{ClusterClient, CommandExecutor};
use trellis_core::domain::gpu::GpuInfo;

/// Host subcommands
#[derive(Subcommand)]
pub enum HostCommands {
    /// List GPUs reported by rocm-smi
    Gpus {
        /// Fail unless exactly this many GPUs are listed
        #[arg(long)]
        expect: Option<usize>,
    },
    /// Show hostname, OS, ROCm release and Slurm partitions
    Info,
}

/// Handle host commands
///
/// # Arguments
/// * `command` - The host command to execute
/// * `client` - Client for the inspected host
pub async fn handle_host_command<E: CommandExecutor>(
    command: HostCommands,
    client: &ClusterClient<E>,
) -> Result<()> {
    match command {
        HostCommands::Gpus { expect } => list_gpus(client, expect).await,
        HostCommands::Info => show_info(client).await,
    }
}

/// List GPUs, optionally checking their count
async fn list_gpus<E: CommandExecutor>(
    client: &ClusterClient<E>,
    expect: Option<usize>,
) -> Result<()> {
    let gpus = client.list_gpus().await?;

    if gpus.is_empty() {
        println!("{}", "No GPUs found.".yellow());
    } else {
        println!("{}", format!("Found {} GPU(s):", gpus.len()).bold());
        println!();
        for gpu in &gpus {
            print_gpu(gpu);
        }
    }

    if let Some(expected) = expect {
        if !client.has_gpu_count(expected).await? {
            anyhow::bail!("expected {} GPU(s), found {}", expected, gpus.len());
        }
        println!("{} GPU count matches {}", "✓".green(), expected);
    }

    Ok(())
}

/// Show a host overview
///
/// Missing tools are reported inline rather than aborting the overview.
async fn show_info<E: CommandExecutor>(client: &ClusterClient<E>) -> Result<()> {
    let hostname = client.hostname().await?;

    println!("{}", "Host Details:".bold());
    println!("  Target:   {}", client.target().cyan());
    println!("  Hostname: {}", hostname);

    match client.whoami().await {
        Ok(user) => println!("  User:     {}", user),
        Err(e) => println!("  User:     {}", e.to_string().red()),
    }

    match client.host_type().await {
        Ok(host_type) if host_type.is_supported() => {
            println!("  OS:       {}", host_type.to_string().green())
        }
        Ok(host_type) => println!(
            "  OS:       {} {}",
            host_type.to_string().yellow(),
            "(unsupported)".dimmed()
        ),
        Err(e) => println!("  OS:       {}", e.to_string().red()),
    }

    match client.rocm_version().await {
        Ok(version) => println!("  ROCm:     {}", version),
        Err(e) => println!("  ROCm:     {}", e.to_string().red()),
    }

    match client.sinfo().await {
        Ok(sinfo) => {
            println!("\n{}", "Slurm:".bold());
            println!("{}", sinfo.trim_end());
        }
        Err(e) => println!("\n{} {}", "Slurm:".bold(), e.to_string().dimmed()),
    }

    Ok(())
}

fn print_gpu(gpu: &GpuInfo) {
    println!("  {} GPU {}", "▸".cyan(), gpu.gpu_id.bold());
    println!("    Node:      {}", gpu.node_id);
    println!(
        "    Partition: {} {} #{}",
        gpu.nps_type, gpu.compute_type, gpu.partition_id
    );
    println!("    Usage:     {}", gpu.usage);
}
