use clap::Parser;
use mongo_river::{EsClient, NoopTransformer, River, RiverConfig};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Replicate a MongoDB collection into an Elasticsearch index")]
struct Opts {
    /// configuration file path.
    #[arg(short, long, default_value = "river.toml")]
    conf: String,
    /// log file path, if not specified, all log information will be output to stdout.
    #[arg(long)]
    log_path: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();
    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match &opts.log_path {
        Some(path) => {
            let path = Path::new(path);
            let dir_name = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "mongo_river.log".to_string());
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let data = std::fs::read_to_string(&opts.conf)?;
    let config = Arc::new(RiverConfig::from_toml(&data)?);
    let sink = Arc::new(EsClient::new(
        config.get_es_url(),
        config.get_es_credentials(),
    )?);

    info!(conf = %opts.conf, river = %config.get_river_name(), "mongodb river starting");
    let river = River::new(config, sink, Arc::new(NoopTransformer));
    river.run();
    Ok(())
}
