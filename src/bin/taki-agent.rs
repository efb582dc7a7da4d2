use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use taki::archive::{Archiver, BuiltinTarArchiver, TarCommandArchiver};
use taki::cli::{AgentOpts, ArchiverKind};
use taki::handshake::announce;
use taki::logger::{Logger, NoopLogger, TextLogger};
use taki::rpc::serve;
use taki::server::{router, ProcRootProbe, Session};

// stdout belongs to the protocol: nothing else may be printed there.
fn main() -> Result<()> {
    let opts = AgentOpts::parse();

    let logger: Arc<dyn Logger> = match &opts.log_file {
        Some(p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("opening log file {}", p.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };

    let archiver: Arc<dyn Archiver> = match opts.archiver {
        ArchiverKind::Tar => Arc::new(TarCommandArchiver {
            program: opts.tar_program.clone(),
            xz: !opts.no_compress,
        }),
        ArchiverKind::Builtin => Arc::new(BuiltinTarArchiver),
    };
    let probe = Arc::new(ProcRootProbe {
        proc_dir: opts.proc_dir.clone(),
        self_root: PathBuf::from("/"),
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let session = Arc::new(Session::new(probe, archiver, Arc::clone(&logger)));
        let mut stdout = tokio::io::stdout();
        announce(&mut stdout).await.context("announcing agent")?;
        let served = serve(Arc::new(router()), session, tokio::io::stdin(), stdout).await;
        if let Err(e) = &served {
            logger.error("serve", &e.to_string());
        }
        served.context("serving operator requests")
    })
}
