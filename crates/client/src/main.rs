use clap::{Parser, Subcommand};
use common::api::{ProfileServiceResponse, ReplaceProfileResponse};
use common::wire::UpdateServiceRequest;
use common::{
    Instance, Profile, ProxyRecord, ProxyStatus, SelectOption, Service, Snapshot, Toast,
};
use reqwest::{Client, Response};
use serde_json::{json, Map, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Dashboard base URL
    #[arg(long, global = true, default_value = "http://localhost:3030")]
    dashboard: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered services
    Services,
    /// Register a service
    AddService {
        name: String,
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long)]
        port: u16,
        /// tcp or udp
        #[arg(long, default_value = "tcp")]
        network: String,
        /// low or high
        #[arg(long, default_value = "low")]
        interaction: String,
    },
    /// Change fields of a registered service
    EditService {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        network: Option<String>,
        #[arg(long)]
        interaction: Option<String>,
    },
    /// Remove a service, detaching the proxies that run it
    RmService { id: String },
    /// List profiles
    Profiles,
    /// Create a profile
    AddProfile {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Rename or describe a profile
    EditProfile {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    RmProfile { id: String },
    /// Add a registered service to a profile
    ProfileAdd { profile: String, service: String },
    /// Remove a service from a profile
    ProfileRm { profile: String, service: String },
    /// List instances
    Instances,
    /// Register an instance
    AddInstance {
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 2022)]
        port: u16,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Change fields of a registered instance
    EditInstance {
        id: u64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        description: Option<String>,
    },
    RmInstance { id: u64 },
    /// Fetch the proxies running on an instance
    Proxies { instance: u64 },
    /// Start a proxy for a registered service on an instance
    Attach { instance: u64, service: String },
    /// Delete a proxy from an instance
    Detach { instance: u64, proxy: String },
    /// Move a proxy to another port
    Port { instance: u64, proxy: String, port: u16 },
    /// Change the service behind a proxy
    EditProxyService {
        instance: u64,
        proxy: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = "localhost")]
        host: String,
    },
    /// Set a proxy to running or stopped
    Status { instance: u64, proxy: String, status: String },
    /// Replace the profile an instance runs
    ApplyProfile { instance: u64, profile: String },
    /// Download the dashboard state
    Export {
        #[arg(default_value = common::SNAPSHOT_FILE)]
        file: PathBuf,
    },
    /// Replace the dashboard state with a snapshot document
    Import { file: PathBuf },
    /// Show the current notification
    Toast,
}

async fn failure(action: &str, resp: Response) {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    match (body.get("error"), body.get("errors")) {
        (Some(error), _) => eprintln!("Failed to {}: {} ({})", action, status, error),
        (_, Some(errors)) => eprintln!("Failed to {}: {} {}", action, status, errors),
        _ => eprintln!("Failed to {}: {}", action, status),
    }
}

/// Builds a shallow patch from the fields that were given on the command line.
fn patch_body(fields: Vec<(&str, Option<Value>)>) -> Value {
    let patch: Map<String, Value> = fields
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key.to_string(), value)))
        .collect();
    Value::Object(patch)
}

async fn send_patch(client: &Client, url: String, patch: &Value) -> reqwest::Result<Response> {
    client.patch(url).json(patch).send().await
}

fn print_service(service: &Service) {
    println!(
        "{}  {}  {}:{}  {}  {}",
        service.id,
        service.name,
        service.host,
        service.port,
        service.network.label(),
        service.interaction.label()
    );
}

fn print_proxy(proxy: &ProxyRecord) {
    println!(
        "{}  port {}  {}  service: {} ({})",
        proxy.id, proxy.port, proxy.status, proxy.service.name, proxy.service.id
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let base = cli.dashboard.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Services => {
            let resp = client.get(format!("{}/services", base)).send().await?;
            if resp.status().is_success() {
                let services: Vec<Service> = resp.json().await?;
                println!("Services:");
                for service in &services {
                    print_service(service);
                }
            } else {
                failure("list services", resp).await;
            }
        }
        Commands::AddService {
            name,
            host,
            port,
            network,
            interaction,
        } => {
            let body = json!({
                "name": name,
                "host": host,
                "port": port,
                "network": network,
                "interaction": interaction,
            });
            let resp = client
                .post(format!("{}/services", base))
                .json(&body)
                .send()
                .await?;
            if resp.status().is_success() {
                let service: Service = resp.json().await?;
                println!("Registered service: {}", service.id);
            } else {
                failure("register service", resp).await;
            }
        }
        Commands::EditService {
            id,
            name,
            host,
            port,
            network,
            interaction,
        } => {
            let patch = patch_body(vec![
                ("name", name.map(Value::from)),
                ("host", host.map(Value::from)),
                ("port", port.map(Value::from)),
                ("network", network.map(Value::from)),
                ("interaction", interaction.map(Value::from)),
            ]);
            let resp = send_patch(&client, format!("{}/services/{}", base, id), &patch).await?;
            if resp.status().is_success() {
                let service: Service = resp.json().await?;
                print_service(&service);
            } else {
                failure("update service", resp).await;
            }
        }
        Commands::RmService { id } => {
            let resp = client.delete(format!("{}/services/{}", base, id)).send().await?;
            if resp.status().is_success() {
                println!("Removed service: {}", id);
            } else {
                failure("remove service", resp).await;
            }
        }
        Commands::Profiles => {
            let resp = client.get(format!("{}/profiles", base)).send().await?;
            if resp.status().is_success() {
                let profiles: Vec<Profile> = resp.json().await?;
                println!("Profiles:");
                for profile in profiles {
                    let names: Vec<&str> =
                        profile.services.iter().map(|s| s.name.as_str()).collect();
                    println!("{}  {}  [{}]", profile.id, profile.name, names.join(", "));
                }
            } else {
                failure("list profiles", resp).await;
            }
        }
        Commands::AddProfile { name, description } => {
            let body = json!({"name": name, "description": description});
            let resp = client
                .post(format!("{}/profiles", base))
                .json(&body)
                .send()
                .await?;
            if resp.status().is_success() {
                let profile: Profile = resp.json().await?;
                println!("Created profile: {}", profile.id);
            } else {
                failure("create profile", resp).await;
            }
        }
        Commands::EditProfile {
            id,
            name,
            description,
        } => {
            let patch = patch_body(vec![
                ("name", name.map(Value::from)),
                ("description", description.map(Value::from)),
            ]);
            let resp = send_patch(&client, format!("{}/profiles/{}", base, id), &patch).await?;
            if resp.status().is_success() {
                let profile: Profile = resp.json().await?;
                println!("Updated profile: {}  {}", profile.id, profile.name);
            } else {
                failure("update profile", resp).await;
            }
        }
        Commands::RmProfile { id } => {
            let resp = client.delete(format!("{}/profiles/{}", base, id)).send().await?;
            if resp.status().is_success() {
                println!("Removed profile: {}", id);
            } else {
                failure("remove profile", resp).await;
            }
        }
        Commands::ProfileAdd { profile, service } => {
            let resp = client
                .post(format!("{}/profiles/{}/services/{}", base, profile, service))
                .send()
                .await?;
            if resp.status().is_success() {
                let answer: ProfileServiceResponse = resp.json().await?;
                if answer.changed {
                    println!("Added {} to {}", service, answer.profile.name);
                } else {
                    println!("{} already contains {}", answer.profile.name, service);
                }
            } else {
                failure("add service to profile", resp).await;
            }
        }
        Commands::ProfileRm { profile, service } => {
            let resp = client
                .delete(format!("{}/profiles/{}/services/{}", base, profile, service))
                .send()
                .await?;
            if resp.status().is_success() {
                let answer: ProfileServiceResponse = resp.json().await?;
                println!(
                    "{} now has {} service(s)",
                    answer.profile.name,
                    answer.profile.services.len()
                );
            } else {
                failure("remove service from profile", resp).await;
            }
        }
        Commands::Instances => {
            let resp = client.get(format!("{}/instances", base)).send().await?;
            if resp.status().is_success() {
                let instances: Vec<Instance> = resp.json().await?;
                println!("Instances:");
                for instance in instances {
                    let profile = instance
                        .profile
                        .as_ref()
                        .map(|p| p.name.as_str())
                        .unwrap_or("-");
                    println!(
                        "{}  {}  {}  profile: {}",
                        instance.id,
                        instance.name,
                        instance.address(),
                        profile
                    );
                }
            } else {
                failure("list instances", resp).await;
            }
        }
        Commands::AddInstance {
            name,
            host,
            port,
            description,
        } => {
            let body = json!({
                "name": name,
                "host": host,
                "port": port,
                "description": description,
            });
            let resp = client
                .post(format!("{}/instances", base))
                .json(&body)
                .send()
                .await?;
            if resp.status().is_success() {
                let instance: Instance = resp.json().await?;
                println!("Registered instance: {}", instance.id);
            } else {
                failure("register instance", resp).await;
            }
        }
        Commands::EditInstance {
            id,
            name,
            host,
            port,
            description,
        } => {
            let patch = patch_body(vec![
                ("name", name.map(Value::from)),
                ("host", host.map(Value::from)),
                ("port", port.map(Value::from)),
                ("description", description.map(Value::from)),
            ]);
            let resp = send_patch(&client, format!("{}/instances/{}", base, id), &patch).await?;
            if resp.status().is_success() {
                let instance: Instance = resp.json().await?;
                println!(
                    "Updated instance: {}  {}  {}",
                    instance.id,
                    instance.name,
                    instance.address()
                );
            } else {
                failure("update instance", resp).await;
            }
        }
        Commands::RmInstance { id } => {
            let resp = client.delete(format!("{}/instances/{}", base, id)).send().await?;
            if resp.status().is_success() {
                println!("Removed instance: {}", id);
            } else {
                failure("remove instance", resp).await;
            }
        }
        Commands::Proxies { instance } => {
            let resp = client
                .get(format!("{}/instances/{}/proxies", base, instance))
                .send()
                .await?;
            if resp.status().is_success() {
                let proxies: Vec<ProxyRecord> = resp.json().await?;
                println!("Proxies on instance {}:", instance);
                for proxy in &proxies {
                    print_proxy(proxy);
                }
            } else {
                failure("fetch proxies", resp).await;
            }
        }
        Commands::Attach { instance, service } => {
            let resp = client
                .post(format!("{}/instances/{}/proxies", base, instance))
                .json(&json!({"service_id": service}))
                .send()
                .await?;
            if resp.status().is_success() {
                let proxy: ProxyRecord = resp.json().await?;
                print_proxy(&proxy);
            } else {
                failure("attach service", resp).await;
            }
        }
        Commands::Detach { instance, proxy } => {
            let resp = client
                .delete(format!("{}/instances/{}/proxies/{}", base, instance, proxy))
                .send()
                .await?;
            if resp.status().is_success() {
                println!("Deleted proxy: {}", proxy);
            } else {
                failure("delete proxy", resp).await;
            }
        }
        Commands::Port { instance, proxy, port } => {
            let resp = client
                .post(format!("{}/instances/{}/proxies/{}/port", base, instance, proxy))
                .json(&json!({"port": port}))
                .send()
                .await?;
            if resp.status().is_success() {
                let proxy: ProxyRecord = resp.json().await?;
                print_proxy(&proxy);
            } else {
                failure("change port", resp).await;
            }
        }
        Commands::EditProxyService {
            instance,
            proxy,
            name,
            port,
            host,
        } => {
            let body = UpdateServiceRequest { name, port, host };
            let resp = client
                .patch(format!(
                    "{}/instances/{}/proxies/{}/service",
                    base, instance, proxy
                ))
                .json(&body)
                .send()
                .await?;
            if resp.status().is_success() {
                let proxy: ProxyRecord = resp.json().await?;
                print_proxy(&proxy);
            } else {
                failure("update proxy service", resp).await;
            }
        }
        Commands::Status { instance, proxy, status } => {
            let Some(status) = ProxyStatus::parse(&status) else {
                eprintln!("Unknown status '{}', expected running or stopped", status);
                return Ok(());
            };
            let resp = client
                .post(format!("{}/instances/{}/proxies/{}/status", base, instance, proxy))
                .json(&json!({"status": status}))
                .send()
                .await?;
            if resp.status().is_success() {
                let answer: Value = resp.json().await?;
                let status = answer["status"].as_str().unwrap_or("unknown");
                println!("Proxy {} is {}", proxy, status);
            } else {
                failure("change status", resp).await;
            }
        }
        Commands::ApplyProfile { instance, profile } => {
            let resp = client
                .put(format!("{}/instances/{}/profile", base, instance))
                .json(&json!({"profile_id": profile}))
                .send()
                .await?;
            if resp.status().is_success() {
                let answer: ReplaceProfileResponse = resp.json().await?;
                println!("Attached {} proxy(ies):", answer.attached.len());
                for proxy in &answer.attached {
                    print_proxy(proxy);
                }
                if !answer.retained.is_empty() {
                    println!(
                        "Could not remove {} proxy(ies) of the previous profile:",
                        answer.retained.len()
                    );
                    for proxy in &answer.retained {
                        print_proxy(proxy);
                    }
                }
            } else {
                failure("apply profile", resp).await;
            }
        }
        Commands::Export { file } => {
            let resp = client.get(format!("{}/state", base)).send().await?;
            if resp.status().is_success() {
                let body = resp.bytes().await?;
                std::fs::write(&file, &body)?;
                println!("Saved state to {}", file.display());
            } else {
                failure("export state", resp).await;
            }
        }
        Commands::Import { file } => {
            let document = std::fs::read_to_string(&file)?;
            let resp = client
                .post(format!("{}/state", base))
                .body(document)
                .send()
                .await?;
            if resp.status().is_success() {
                let snapshot: Snapshot = resp.json().await?;
                println!(
                    "Imported {} service(s), {} profile(s), {} instance(s)",
                    snapshot.services.len(),
                    snapshot.profiles.len(),
                    snapshot.instances.len()
                );
            } else {
                failure("import state", resp).await;
            }
        }
        Commands::Toast => {
            let resp = client.get(format!("{}/toast", base)).send().await?;
            if resp.status().is_success() {
                let toast: Toast = resp.json().await?;
                if toast.show {
                    println!("[{}] {}", toast.title, toast.message);
                } else {
                    println!("No notification");
                }
            } else {
                failure("fetch notification", resp).await;
            }
        }
    }

    Ok(())
}
