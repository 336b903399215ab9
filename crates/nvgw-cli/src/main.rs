//! nvgw: thin admin client for the gateway daemon.
//!
//! Exit codes: 0 success, 1 usage error, 2 server error, 3 connection
//! error.

mod client;

use clap::{Args, Parser, Subcommand};

use client::{check_status, ClientError, GatewayClient};
use nvgw_daemon::protocol::messages::{
    ConnectionListRequest, ConnectionListResponse, GatewayInfoRequest, GatewayInfoResponse,
    GetSubsystemsRequest, GetSubsystemsResponse, HostAddRequest, HostDelRequest,
    ListenerAddRequest, ListenerDelRequest, MessageType, NamespaceAddRequest,
    NamespaceAddResponse, NamespaceChangeLbGroupRequest, NamespaceDelRequest,
    NamespaceHostRequest, NamespaceResizeRequest, SetLogLevelRequest, StatusResponse,
    SubsystemAddRequest, SubsystemAddResponse, SubsystemDelRequest,
};

/// nvgw gateway admin client.
#[derive(Parser, Debug)]
#[command(name = "nvgw")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Gateway admin address.
    #[arg(long, global = true, default_value = "127.0.0.1:5500")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subsystem operations.
    Subsystem {
        #[command(subcommand)]
        command: SubsystemCommand,
    },
    /// Namespace operations.
    Namespace {
        #[command(subcommand)]
        command: NamespaceCommand,
    },
    /// Listener operations.
    Listener {
        #[command(subcommand)]
        command: ListenerCommand,
    },
    /// Host ACL operations.
    Host {
        #[command(subcommand)]
        command: HostCommand,
    },
    /// Connection inspection.
    Connection {
        #[command(subcommand)]
        command: ConnectionCommand,
    },
    /// Gateway information.
    Gw {
        #[command(subcommand)]
        command: GwCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SubsystemCommand {
    /// Create a subsystem.
    Add(SubsystemAddArgs),
    /// Delete a subsystem.
    Del {
        /// Subsystem NQN.
        #[arg(long)]
        subnqn: String,
        /// Delete namespaces, hosts and keys too.
        #[arg(long)]
        force: bool,
    },
    /// List engine-reported subsystems.
    List,
}

#[derive(Args, Debug)]
struct SubsystemAddArgs {
    /// Subsystem NQN.
    #[arg(long)]
    subnqn: String,
    /// Serial number (generated when omitted).
    #[arg(long)]
    serial: Option<String>,
    /// Maximum namespaces.
    #[arg(long)]
    max_namespaces: Option<u32>,
    /// Do not append the gateway group to the NQN.
    #[arg(long)]
    no_group_append: bool,
}

#[derive(Subcommand, Debug)]
enum NamespaceCommand {
    /// Create a namespace.
    Add(NamespaceAddArgs),
    /// Delete a namespace.
    Del {
        /// Subsystem NQN.
        #[arg(long)]
        subnqn: String,
        /// Namespace id.
        #[arg(long)]
        nsid: u32,
    },
    /// Grow a namespace.
    Resize {
        /// Subsystem NQN.
        #[arg(long)]
        subnqn: String,
        /// Namespace id.
        #[arg(long)]
        nsid: u32,
        /// New size in bytes.
        #[arg(long)]
        size: u64,
    },
    /// Move a namespace to another load-balancing group.
    ChangeLbGroup {
        /// Subsystem NQN.
        #[arg(long)]
        subnqn: String,
        /// Namespace id.
        #[arg(long)]
        nsid: u32,
        /// Target group.
        #[arg(long)]
        lb_group: u32,
    },
    /// Grant a host visibility of a non-auto-visible namespace.
    AddHost {
        /// Subsystem NQN.
        #[arg(long)]
        subnqn: String,
        /// Namespace id.
        #[arg(long)]
        nsid: u32,
        /// Host NQN.
        #[arg(long)]
        host_nqn: String,
    },
    /// Revoke a host's visibility of a namespace.
    DelHost {
        /// Subsystem NQN.
        #[arg(long)]
        subnqn: String,
        /// Namespace id.
        #[arg(long)]
        nsid: u32,
        /// Host NQN.
        #[arg(long)]
        host_nqn: String,
    },
}

#[derive(Args, Debug)]
struct NamespaceAddArgs {
    /// Subsystem NQN.
    #[arg(long)]
    subnqn: String,
    /// Backing pool.
    #[arg(long)]
    pool: String,
    /// Backing image.
    #[arg(long)]
    image: String,
    /// Explicit namespace id (lowest free when omitted).
    #[arg(long)]
    nsid: Option<u32>,
    /// Declared size in bytes.
    #[arg(long)]
    size: Option<u64>,
    /// Explicit UUID (generated when omitted).
    #[arg(long)]
    uuid: Option<String>,
    /// Load-balancing group.
    #[arg(long)]
    lb_group: Option<u32>,
    /// Block size in bytes.
    #[arg(long)]
    block_size: Option<u32>,
    /// Restrict visibility to per-host grants.
    #[arg(long)]
    no_auto_visible: bool,
}

#[derive(Subcommand, Debug)]
enum ListenerCommand {
    /// Create a listener on a gateway.
    Add(ListenerArgs),
    /// Delete a listener.
    Del(ListenerArgs),
}

#[derive(Args, Debug)]
struct ListenerArgs {
    /// Subsystem NQN.
    #[arg(long)]
    subnqn: String,
    /// Gateway that owns the listener.
    #[arg(long)]
    gateway_name: String,
    /// Transport address.
    #[arg(long)]
    traddr: String,
    /// Transport service id (port).
    #[arg(long, default_value_t = 4420)]
    trsvcid: u16,
    /// Address family.
    #[arg(long, default_value = "ipv4")]
    adrfam: String,
    /// Require a secure channel.
    #[arg(long)]
    secure: bool,
}

#[derive(Subcommand, Debug)]
enum HostCommand {
    /// Grant a host (or "*") access to a subsystem.
    Add {
        /// Subsystem NQN.
        #[arg(long)]
        subnqn: String,
        /// Host NQN or "*".
        #[arg(long)]
        host_nqn: String,
        /// PSK in interchange format.
        #[arg(long)]
        psk: Option<String>,
        /// DH-CHAP host key in interchange format.
        #[arg(long)]
        dhchap: Option<String>,
        /// DH-CHAP controller key in interchange format.
        #[arg(long)]
        dhchap_ctrlr: Option<String>,
    },
    /// Revoke a host grant.
    Del {
        /// Subsystem NQN.
        #[arg(long)]
        subnqn: String,
        /// Host NQN or "*".
        #[arg(long)]
        host_nqn: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConnectionCommand {
    /// List controller connections for a subsystem.
    List {
        /// Subsystem NQN.
        #[arg(long)]
        subnqn: String,
    },
}

#[derive(Subcommand, Debug)]
enum GwCommand {
    /// Show gateway identity and version.
    Info,
    /// Change the gateway log level.
    SetLogLevel {
        /// Level (trace, debug, info, warn, error).
        #[arg(long)]
        level: String,
    },
    /// Change the engine log level.
    SetSpdkLogLevel {
        /// Engine level spelling.
        #[arg(long)]
        level: String,
    },
}

fn main() {
    // Usage errors exit 1 per the CLI contract.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = if e.use_stderr() { 1 } else { 0 };
            std::process::exit(code);
        }
    };

    let client = GatewayClient::new(cli.server.clone());
    match run(&client, cli.command) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}

#[allow(clippy::too_many_lines)] // one arm per subcommand, mechanical
fn run(client: &GatewayClient, command: Command) -> Result<(), ClientError> {
    match command {
        Command::Subsystem { command } => match command {
            SubsystemCommand::Add(args) => {
                let response: SubsystemAddResponse = client.call(
                    MessageType::SubsystemAdd,
                    &SubsystemAddRequest {
                        nqn: args.subnqn,
                        serial: args.serial,
                        max_namespaces: args.max_namespaces,
                        no_group_append: args.no_group_append,
                    },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("created subsystem {} (serial {})", response.nqn, response.serial);
            }
            SubsystemCommand::Del { subnqn, force } => {
                let response: StatusResponse = client.call(
                    MessageType::SubsystemDel,
                    &SubsystemDelRequest { nqn: subnqn.clone(), force },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("deleted subsystem {subnqn}");
            }
            SubsystemCommand::List => {
                let response: GetSubsystemsResponse =
                    client.call(MessageType::GetSubsystems, &GetSubsystemsRequest {})?;
                check_status(response.status, &response.error_message)?;
                for sub in response.subsystems {
                    println!(
                        "{}  serial={}  max-namespaces={}  allow-any-host={}",
                        sub.nqn, sub.serial, sub.max_namespaces, sub.allow_any_host
                    );
                    for ns in sub.namespaces {
                        println!(
                            "  nsid={}  bdev={}  uuid={}  lb-group={}",
                            ns.nsid, ns.bdev_name, ns.uuid, ns.lb_group
                        );
                    }
                    for listener in sub.listeners {
                        println!(
                            "  listener {}://{}:{}  secure={}",
                            listener.transport.to_lowercase(),
                            listener.traddr,
                            listener.trsvcid,
                            listener.secure
                        );
                    }
                    for host in sub.hosts {
                        println!("  host {host}");
                    }
                }
            }
        },
        Command::Namespace { command } => match command {
            NamespaceCommand::Add(args) => {
                let response: NamespaceAddResponse = client.call(
                    MessageType::NamespaceAdd,
                    &NamespaceAddRequest {
                        nqn: args.subnqn,
                        nsid: args.nsid,
                        pool: args.pool,
                        image: args.image,
                        size_bytes: args.size,
                        uuid: args.uuid,
                        lb_group: args.lb_group,
                        auto_visible: Some(!args.no_auto_visible),
                        block_size: args.block_size,
                    },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("created namespace nsid={} uuid={}", response.nsid, response.uuid);
            }
            NamespaceCommand::Del { subnqn, nsid } => {
                let response: StatusResponse = client.call(
                    MessageType::NamespaceDel,
                    &NamespaceDelRequest { nqn: subnqn, nsid },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("deleted namespace nsid={nsid}");
            }
            NamespaceCommand::Resize { subnqn, nsid, size } => {
                let response: StatusResponse = client.call(
                    MessageType::NamespaceResize,
                    &NamespaceResizeRequest {
                        nqn: subnqn,
                        nsid,
                        new_size_bytes: size,
                    },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("resized namespace nsid={nsid} to {size} bytes");
            }
            NamespaceCommand::ChangeLbGroup {
                subnqn,
                nsid,
                lb_group,
            } => {
                let response: StatusResponse = client.call(
                    MessageType::NamespaceChangeLbGroup,
                    &NamespaceChangeLbGroupRequest {
                        nqn: subnqn,
                        nsid,
                        lb_group,
                    },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("namespace nsid={nsid} moved to group {lb_group}");
            }
            NamespaceCommand::AddHost {
                subnqn,
                nsid,
                host_nqn,
            } => {
                let response: StatusResponse = client.call(
                    MessageType::NamespaceAddHost,
                    &NamespaceHostRequest {
                        nqn: subnqn,
                        nsid,
                        host_nqn: host_nqn.clone(),
                    },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("host {host_nqn} can now see nsid={nsid}");
            }
            NamespaceCommand::DelHost {
                subnqn,
                nsid,
                host_nqn,
            } => {
                let response: StatusResponse = client.call(
                    MessageType::NamespaceDelHost,
                    &NamespaceHostRequest {
                        nqn: subnqn,
                        nsid,
                        host_nqn: host_nqn.clone(),
                    },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("host {host_nqn} can no longer see nsid={nsid}");
            }
        },
        Command::Listener { command } => match command {
            ListenerCommand::Add(args) => {
                let response: StatusResponse = client.call(
                    MessageType::ListenerAdd,
                    &ListenerAddRequest {
                        nqn: args.subnqn,
                        gateway: args.gateway_name,
                        transport: "tcp".to_string(),
                        adrfam: args.adrfam,
                        traddr: args.traddr.clone(),
                        trsvcid: u32::from(args.trsvcid),
                        secure: args.secure,
                    },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("created listener {}:{}", args.traddr, args.trsvcid);
            }
            ListenerCommand::Del(args) => {
                let response: StatusResponse = client.call(
                    MessageType::ListenerDel,
                    &ListenerDelRequest {
                        nqn: args.subnqn,
                        gateway: args.gateway_name,
                        transport: "tcp".to_string(),
                        adrfam: args.adrfam,
                        traddr: args.traddr.clone(),
                        trsvcid: u32::from(args.trsvcid),
                    },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("deleted listener {}:{}", args.traddr, args.trsvcid);
            }
        },
        Command::Host { command } => match command {
            HostCommand::Add {
                subnqn,
                host_nqn,
                psk,
                dhchap,
                dhchap_ctrlr,
            } => {
                let response: StatusResponse = client.call(
                    MessageType::HostAdd,
                    &HostAddRequest {
                        nqn: subnqn,
                        host_nqn: host_nqn.clone(),
                        psk,
                        dhchap,
                        dhchap_ctrlr,
                    },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("granted {host_nqn} access");
            }
            HostCommand::Del { subnqn, host_nqn } => {
                let response: StatusResponse = client.call(
                    MessageType::HostDel,
                    &HostDelRequest {
                        nqn: subnqn,
                        host_nqn: host_nqn.clone(),
                    },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("revoked {host_nqn} access");
            }
        },
        Command::Connection { command } => match command {
            ConnectionCommand::List { subnqn } => {
                let response: ConnectionListResponse = client.call(
                    MessageType::ConnectionList,
                    &ConnectionListRequest { nqn: subnqn },
                )?;
                check_status(response.status, &response.error_message)?;
                for row in response.connections {
                    if row.connected {
                        println!(
                            "{}  {}:{}  qpairs={}  cntlid={}  secure={}  psk={}  dhchap={}  connected=true",
                            row.host_nqn,
                            row.traddr,
                            row.trsvcid,
                            row.qpair_count,
                            row.controller_id,
                            row.secure,
                            row.use_psk,
                            row.use_dhchap
                        );
                    } else {
                        println!("{}  connected=false", row.host_nqn);
                    }
                }
            }
        },
        Command::Gw { command } => match command {
            GwCommand::Info => {
                let response: GatewayInfoResponse =
                    client.call(MessageType::GatewayInfo, &GatewayInfoRequest {})?;
                check_status(response.status, &response.error_message)?;
                println!("name:             {}", response.name);
                println!("group:            {}", response.group);
                println!("version:          {}", response.version);
                println!("address:          {}:{}", response.addr, response.port);
                println!(
                    "optimized groups: {}",
                    response
                        .optimized_groups
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            GwCommand::SetLogLevel { level } => {
                let response: StatusResponse = client.call(
                    MessageType::SetLogLevel,
                    &SetLogLevelRequest { level: level.clone() },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("gateway log level set to {level}");
            }
            GwCommand::SetSpdkLogLevel { level } => {
                let response: StatusResponse = client.call(
                    MessageType::SetTgtLogLevel,
                    &SetLogLevelRequest { level: level.clone() },
                )?;
                check_status(response.status, &response.error_message)?;
                println!("engine log level set to {level}");
            }
        },
    }
    Ok(())
}
