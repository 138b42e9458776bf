//! The `arc` client binary: run one ARC command against a server.

use clap::Parser;

use arcd::client::{self, ClientConfig};
use arcd::protocol::ProtocolVersion;
use arcd::sasl::Mechanism;

#[derive(Parser, Debug)]
#[command(name = "arc", version, about)]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 4373)]
    port: u16,

    #[arg(long, value_enum, default_value = "scram-sha-256")]
    mechanism: MechanismArg,

    #[arg(long)]
    user: String,

    /// Read from the `ARC_PASSWORD` environment variable if unset.
    #[arg(long)]
    password: Option<String>,

    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[arg(long, default_value = "ARC/2.1")]
    protocol_version: String,

    /// Listen locally and have the server connect back for the data
    /// channel (`CMDPORT`) instead of connecting to the server's `CMDPASV`
    /// port. Requires `--protocol-version ARC/2.1`.
    #[arg(long)]
    cmdport: bool,

    /// The registered command name to run, plus its arguments.
    #[arg(required = true, num_args = 1..)]
    command: Vec<String>,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum MechanismArg {
    Plain,
    ScramSha256,
}

impl From<MechanismArg> for Mechanism {
    fn from(value: MechanismArg) -> Self {
        match value {
            MechanismArg::Plain => Mechanism::Plain,
            MechanismArg::ScramSha256 => Mechanism::ScramSha256,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let password = match args.password {
        Some(p) => p,
        None => std::env::var("ARC_PASSWORD")
            .map_err(|_| anyhow::anyhow!("--password not given and ARC_PASSWORD is not set"))?,
    };

    let protocol_version: ProtocolVersion = args.protocol_version.parse()?;

    let config = ClientConfig {
        host: args.host,
        port: args.port,
        mechanism: args.mechanism.into(),
        authzid: args.user.clone(),
        username: args.user,
        password,
        timeout_seconds: args.timeout,
        protocol_version,
        use_cmdport: args.cmdport,
    };

    let command = args.command.join(" ");
    let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    let code = client::run_command(&config, &command, stdio).await?;

    std::process::exit(code);
}
