use std::{env, error::Error, path::PathBuf};

use slide_volume::{
    Camera, GpuContext, GpuVolumeRenderer, Viewer, ViewerConfig, ViewerError,
};

const VIEWPORT: (u32, u32) = (800, 600);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args().skip(1);
    let path = PathBuf::from(args.next().unwrap_or_else(|| "slide.tiff".into()));
    let config = match args.next() {
        Some(config_path) => ViewerConfig::load(config_path)?,
        None => ViewerConfig::default(),
    };

    let mut viewer = Viewer::new(config)?;
    viewer.load_volume(&path)?;

    match viewer.load_best_resolution() {
        Ok(level) => {
            log::info!("Showing level {level}");
            viewer.zoom_in()?;
        }
        Err(ViewerError::NotNavigable) => log::info!("Single-resolution volume"),
        Err(err) => return Err(err.into()),
    }
    log::info!("Volume size {:?}", viewer.current_size()?);

    // Hide near-white slide background
    let transfer = viewer.transfer_functions_mut();
    let background = transfer.add_color_entry([240, 240, 240], 20.0, 0.0)?;
    log::info!("Added colour entry {background:?}");

    if let Some(image) = viewer.volume_buffer().and_then(|buffer| buffer.slice_image(0)) {
        image.save("result.png")?;
    }

    match GpuContext::request().await {
        Ok(context) => {
            let mut renderer = GpuVolumeRenderer::new(context, VIEWPORT);
            let camera = Camera::new(VIEWPORT.0, VIEWPORT.1);
            renderer.sync(&mut viewer, &camera)?;
            log::info!("Volume and lookup textures uploaded");
        }
        Err(err) => log::warn!("Skipping GPU upload: {err}"),
    }

    Ok(())
}
