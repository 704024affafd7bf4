// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Context;
use podtunnel::portforward::{self, PortSpec};
use podtunnel::resolve::{ApiResolver, PodRef, PodResolver};
use podtunnel::*;
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    telemetry::setup_logging();

    // No complex CLI needed, so rather than pull in dependencies just use basic argv
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match args.first().map(String::as_str) {
        Some("forward") => Command::Forward(&args[1..]),
        Some("find") => Command::Find(&args[1..]),
        Some("version") => return version(),
        None | Some("help") => return help(),
        Some(unknown) => {
            eprintln!("unknown command: {unknown}");
            help()?;
            std::process::exit(1)
        }
    };
    let config = config::parse_config()?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            match command {
                Command::Forward(args) => forward(config, args).await,
                Command::Find(args) => find(config, args).await,
            }
        })
}

enum Command<'a> {
    Forward(&'a [String]),
    Find(&'a [String]),
}

fn help() -> anyhow::Result<()> {
    let version = version::BuildInfo::new();
    println!(
        "
podtunnel ({version})

Commands:
forward NAMESPACE POD [LOCAL:]REMOTE... - Forward local ports to a pod until interrupted
find NAMESPACE PREFIX IMAGE             - Print the pod matching a name prefix and image
version                                 - Print the version of podtunnel
help                                    - Print commands and version of podtunnel"
    );
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", version::BuildInfo::new());
    Ok(())
}

async fn forward(cfg: config::Config, args: &[String]) -> anyhow::Result<()> {
    let [namespace, pod, ports @ ..] = args else {
        anyhow::bail!("usage: forward NAMESPACE POD [LOCAL:]REMOTE...");
    };
    let ports = ports
        .iter()
        .map(|p| p.parse::<PortSpec>())
        .collect::<Result<Vec<_>, _>>()?;
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&cfg)?);

    let target = PodRef::new(namespace.as_str(), pod.as_str());
    let mut tunnel = portforward::establish(&cfg, &target, &ports, cfg.ready_timeout).await?;
    for binding in tunnel.bindings() {
        println!("Forwarding from {binding}");
    }

    let result = tokio::select! {
        res = signal::shutdown() => {
            res.context("waiting for shutdown signal")?;
            info!("received shutdown signal");
            Ok(())
        }
        fault = tunnel.faulted() => match fault {
            Some(e) => Err(e),
            None => Ok(()),
        },
    };
    tunnel.teardown().await;
    if let Err(e) = &result {
        warn!("{e}");
    }
    Ok(result?)
}

async fn find(cfg: config::Config, args: &[String]) -> anyhow::Result<()> {
    let [namespace, prefix, image] = args else {
        anyhow::bail!("usage: find NAMESPACE PREFIX IMAGE");
    };
    let pod = ApiResolver::new(cfg.cluster)
        .resolve(namespace, prefix, image)
        .await?;
    println!("{pod}");
    Ok(())
}
