use clap::Parser;
use plate_vision::{
    cli::Cli, download_models, init_logging, plate_vision_service, system_info::system_info,
};
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let mut args = Cli::parse();
    let _guard = init_logging(args.log_level, &mut args.log_path)?;
    system_info()?;
    args.print_config();

    if args.list_models {
        download_models::list_models();
        return Ok(());
    }

    if let Some(download_path) = args.download_model_path.take() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(async {
            download_models::download_model(download_path, download_models::Model::All).await
        })?;
        return Ok(());
    }

    // Run the tokio runtime on the main thread
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let (service_future, cancellation_token) = plate_vision_service(args)?;

    let ctrl_c_shutdown = cancellation_token.clone();
    rt.spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down server");
        ctrl_c_shutdown.cancel();
    });

    let worker_handle = rt.block_on(service_future)?;
    if let Some(handle) = worker_handle {
        info!("Waiting for worker thread to complete...");
        if let Err(e) = handle.join() {
            error!("Worker thread panicked: {:?}", e);
        }
    }

    Ok(())
}
