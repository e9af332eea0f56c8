/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use seashell::config::Config;
use tracing::metadata::LevelFilter;

#[derive(clap::Parser, Debug)]
struct Cli {
    #[clap(long, short, help = "Turn on debug logging (same as RUST_LOG=debug)")]
    debug: bool,
    #[clap(
        long,
        short,
        default_value = "seashell.hcl",
        help = "Path to HCL configuration file"
    )]
    config: PathBuf,
    #[clap(long, help = "Read a password and print its argon2id hash")]
    gen_hash: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.gen_hash {
        return gen_hash();
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            setup_logging(cli.debug);
            tracing::error!(%error, "error loading config file");
            return ExitCode::FAILURE;
        }
    };

    setup_logging(cli.debug || config.settings.debug);

    tracing::info!(
        addr = %config.settings.listen_addr,
        "starting seashell server"
    );

    match seashell::spawn(config).await {
        Ok(handle) => {
            // Let the service run forever by awaiting the join handle,
            // while holding onto the shutdown handle.
            let (_shutdown_tx, join_handle) = handle.into_parts();
            join_handle.await.expect("seashell server task panicked");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(%error, "error while starting server");
            ExitCode::FAILURE
        }
    }
}

/// Prompts for a password with no echo and prints its argon2id hash.
fn gen_hash() -> ExitCode {
    let password = match rpassword::prompt_password("Password: ") {
        Ok(password) => password,
        Err(error) => {
            eprintln!("Error reading password from terminal: {error}");
            return ExitCode::FAILURE;
        }
    };

    match seashell::auth::generate_hash(&password) {
        Ok(hash) => {
            println!("{hash}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("Error calculating argon2id hash: {error}");
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(debug: bool) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    if let Err(error) = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::Layer::default().compact())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .try_init()
    {
        panic!(
            "Failed to initialize trace logging for seashell. It's possible some earlier \
            code path has already set a global default log subscriber: {error}"
        );
    }
}
