//! The `prover-inputs` command-line surface.
//!
//! Every flag has an environment-variable equivalent; flags override the
//! environment, which overrides defaults. Exit codes: 0 success, 1 runtime
//! failure, 2 invalid flags or inputs.

use std::path::PathBuf;
use std::sync::Arc;

use alloy::rpc::types::BlockNumberOrTag;
use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use prover_store::{
    ContentEncoding, ContentType, FileStore, MultiStore, S3Config, S3Store, Store,
};
use url::Url;

use crate::generator::Generator;
use crate::include::Include;
use crate::rpc::retry::{
    build_retry_provider, DEFAULT_BACKOFF, DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT,
};
use crate::rpc::ChainClient;
use crate::stages::StageError;
use crate::telemetry::LogFormat;

#[derive(Parser)]
#[command(name = "prover-inputs", version, about = "Generate, persist and verify prover inputs for EVM blocks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the full pipeline: preflight, prepare, then execute.
    Generate(RunArgs),
    /// Execute the block against remote state and persist the heavy input.
    Preflight(RunArgs),
    /// Derive and persist the final prover input from a stored heavy input.
    Prepare(RunArgs),
    /// Replay a stored prover input and verify it against the header.
    Execute(RunArgs),
    /// Print the build identifier.
    Version,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum StoreLocation {
    #[default]
    File,
    S3,
}

#[derive(Args)]
pub struct RunArgs {
    /// Block to process: decimal, 0x-hex, or latest|earliest|pending|safe|finalized.
    #[arg(long, env = "BLOCK_NUMBER")]
    pub block_number: BlockNumberOrTag,

    /// Chain id; fetched from the node when a RPC URL is configured.
    #[arg(long, env = "CHAIN_ID")]
    pub chain_id: Option<u64>,

    /// Archive node JSON-RPC URL.
    #[arg(long, env = "CHAIN_RPC_URL", value_hint = ValueHint::Url)]
    pub chain_rpc_url: Option<Url>,

    /// Root directory for file-backed artifact storage.
    #[arg(long, env = "DATA_DIR", default_value = "data/inputs", value_hint = ValueHint::DirPath)]
    pub data_dir: PathBuf,

    #[arg(long, env = "STORE_LOCATION", value_enum, default_value_t)]
    pub store_location: StoreLocation,

    /// Final artifact serialization: json or protobuf.
    #[arg(long, env = "STORE_CONTENT_TYPE", default_value = "json")]
    pub store_content_type: ContentType,

    /// Final artifact compression: gzip, zlib, flate, or empty for none.
    #[arg(long, env = "STORE_CONTENT_ENCODING", default_value = "")]
    pub store_content_encoding: ContentEncoding,

    #[arg(long, env = "AWS_S3_BUCKET")]
    pub aws_s3_bucket: Option<String>,

    #[arg(long, env = "AWS_S3_KEY_PREFIX")]
    pub aws_s3_key_prefix: Option<String>,

    #[arg(long, env = "AWS_S3_ACCESS_KEY")]
    pub aws_s3_access_key: Option<String>,

    #[arg(long, env = "AWS_S3_SECRET_KEY")]
    pub aws_s3_secret_key: Option<String>,

    #[arg(long, env = "AWS_S3_REGION")]
    pub aws_s3_region: Option<String>,

    /// Extra debug data to embed in the final artifact:
    /// accessList,preState,stateDiffs,committed,all,none.
    #[arg(long, env = "INCLUDE", default_value = "none")]
    pub include: Include,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t)]
    pub log_format: LogFormat,
}

impl RunArgs {
    /// The store backing the final artifacts, per the location flag.
    async fn build_leaf_store(&self) -> Result<Arc<dyn Store>, StageError> {
        Ok(match self.store_location {
            StoreLocation::File => Arc::new(FileStore::new(&self.data_dir)),
            StoreLocation::S3 => Arc::new(
                S3Store::new(S3Config {
                    bucket: self.aws_s3_bucket.clone().unwrap_or_default(),
                    key_prefix: self.aws_s3_key_prefix.clone(),
                    region: self.aws_s3_region.clone(),
                    access_key: self.aws_s3_access_key.clone(),
                    secret_key: self.aws_s3_secret_key.clone(),
                })
                .await?,
            ),
        })
    }

    /// Builds the fully wired generator.
    pub async fn build_generator(
        &self,
    ) -> Result<
        Generator<
            alloy::providers::RootProvider<
                crate::rpc::retry::RetryService<alloy::transports::http::ReqwestTransport>,
            >,
            crate::rpc::retry::RetryService<alloy::transports::http::ReqwestTransport>,
        >,
        StageError,
    > {
        let client = self.chain_rpc_url.clone().map(|url| {
            Arc::new(ChainClient::new(build_retry_provider(
                url,
                DEFAULT_BACKOFF,
                DEFAULT_MAX_RETRIES,
                DEFAULT_REQUEST_TIMEOUT,
            )))
        });

        // Heavy inputs always live on the local filesystem; final inputs go
        // to the configured backends behind fan-out and compression.
        let heavy_store = crate::stores::HeavyProverInputStore::new(Arc::new(FileStore::new(
            &self.data_dir,
        )));
        let leaf = self.build_leaf_store().await?;
        let multi = Arc::new(MultiStore::new(vec![leaf])?) as Arc<dyn Store>;
        let input_store = crate::stores::ProverInputStore::new(
            multi,
            self.store_content_type,
            self.store_content_encoding,
        );

        let mut generator = Generator::new(
            client,
            self.chain_id,
            self.include,
            heavy_store,
            input_store,
        );
        generator.start().await?;
        Ok(generator)
    }
}

impl Cli {
    pub async fn run(self) -> Result<(), StageError> {
        let args = match &self.command {
            Command::Version => {
                println!("{}", crate::version());
                return Ok(());
            }
            Command::Generate(args)
            | Command::Preflight(args)
            | Command::Prepare(args)
            | Command::Execute(args) => args,
        };

        crate::telemetry::init(&args.log_level, args.log_format)
            .map_err(|err| StageError::InvalidInput(format!("bad log configuration: {err}")))?;

        let generator = args.build_generator().await?;
        match &self.command {
            Command::Generate(args) => {
                let report = generator.generate(args.block_number).await?;
                tracing::info!(
                    block = report.block_number,
                    state_root = %report.state_root,
                    gas_used = report.gas_used,
                    "prover input generated and verified",
                );
            }
            Command::Preflight(args) => {
                generator.preflight(args.block_number).await?;
            }
            Command::Prepare(args) => {
                generator.prepare(args.block_number).await?;
            }
            Command::Execute(args) => {
                let report = generator.execute(args.block_number).await?;
                tracing::info!(
                    block = report.block_number,
                    state_root = %report.state_root,
                    gas_used = report.gas_used,
                    "replay verified",
                );
            }
            Command::Version => unreachable!("handled above"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("valid command line")
    }

    #[test]
    fn block_number_accepts_every_documented_form() {
        let cli = parse(&["prover-inputs", "preflight", "--block-number", "21465322"]);
        let Command::Preflight(args) = cli.command else {
            panic!("wrong subcommand")
        };
        assert_eq!(args.block_number, BlockNumberOrTag::Number(21_465_322));

        let cli = parse(&["prover-inputs", "preflight", "--block-number", "0x147ac6a"]);
        let Command::Preflight(args) = cli.command else {
            panic!("wrong subcommand")
        };
        assert_eq!(args.block_number, BlockNumberOrTag::Number(0x147ac6a));

        for (text, tag) in [
            ("latest", BlockNumberOrTag::Latest),
            ("earliest", BlockNumberOrTag::Earliest),
            ("pending", BlockNumberOrTag::Pending),
            ("safe", BlockNumberOrTag::Safe),
            ("finalized", BlockNumberOrTag::Finalized),
        ] {
            let cli = parse(&["prover-inputs", "execute", "--block-number", text]);
            let Command::Execute(args) = cli.command else {
                panic!("wrong subcommand")
            };
            assert_eq!(args.block_number, tag);
        }
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let cli = parse(&["prover-inputs", "generate", "--block-number", "1"]);
        let Command::Generate(args) = cli.command else {
            panic!("wrong subcommand")
        };
        assert_eq!(args.data_dir, PathBuf::from("data/inputs"));
        assert_eq!(args.store_location, StoreLocation::File);
        assert_eq!(args.store_content_type, ContentType::Json);
        assert_eq!(args.store_content_encoding, ContentEncoding::Plain);
        assert_eq!(args.include, Include::NONE);
        assert_eq!(args.log_level, "info");
        assert_eq!(args.log_format, LogFormat::Text);
    }

    #[test]
    fn invalid_flags_fail_parsing() {
        assert!(Cli::try_parse_from(["prover-inputs", "generate"]).is_err());
        assert!(Cli::try_parse_from([
            "prover-inputs",
            "generate",
            "--block-number",
            "not-a-block"
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "prover-inputs",
            "generate",
            "--block-number",
            "1",
            "--store-content-encoding",
            "zstd"
        ])
        .is_err());
    }

    #[test]
    fn version_subcommand_parses() {
        let cli = parse(&["prover-inputs", "version"]);
        assert!(matches!(cli.command, Command::Version));
    }
}
