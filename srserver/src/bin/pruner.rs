use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use srserver::pruner::prune;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "./registry-data")]
    storage: PathBuf,

    // development control plane seed, same format the server takes
    #[arg(long)]
    seed: Option<PathBuf>,

    #[arg(long)]
    dry_run: bool,
}

#[derive(serde::Deserialize, Default)]
struct Seed {
    #[serde(default)]
    streams: Vec<srmeta::ImageStream>,
    #[serde(default)]
    images: Vec<srmeta::Image>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let driver = Arc::new(srdriver::FsDriver::new(&args.storage).expect("opening storage"));

    let meta = srmeta::FakeMetadataClient::new();
    if let Some(seed_path) = &args.seed {
        let data = std::fs::read_to_string(seed_path).expect("reading seed file");
        let seed: Seed = serde_json::from_str(&data).expect("parsing seed file");
        for stream in seed.streams {
            meta.put_stream(stream);
        }
        for image in seed.images {
            meta.put_image(image);
        }
    }

    let report = prune(
        driver.as_ref(),
        driver.as_ref(),
        driver.as_ref(),
        &meta,
        args.dry_run,
    )
    .await
    .expect("prune failed");

    println!(
        "{}: deleted={} freed_bytes={} orphan_links={}",
        if args.dry_run { "dry run" } else { "pruned" },
        report.deleted,
        report.freed_bytes,
        report.orphan_links
    );
}
