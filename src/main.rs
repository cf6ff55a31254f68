use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use simplelog::{Config, LevelFilter, WriteLogger};

use pagetiles::settings::{self, Settings};
use pagetiles::tiles::{
    Bitmap, BitmapCache, CacheKey, Completion, DocumentId, DocumentModel, RenderFault, RenderJob,
    TileService, TileStats,
};
use pagetiles::viewport::{ScrollDirection, Viewport, ViewportState};

#[derive(Parser)]
#[command(
    name = "pagetiles",
    version,
    about = "Drive the tile cache through a scripted scroll/zoom/rotate session"
)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 12)]
    pages: usize,
    #[arg(long, default_value_t = 612.0)]
    page_width: f32,
    #[arg(long, default_value_t = 792.0)]
    page_height: f32,
    #[arg(long, default_value_t = 1280)]
    viewport_width: u32,
    #[arg(long, default_value_t = 800)]
    viewport_height: u32,
    /// Gap between pages in device pixels
    #[arg(long, default_value_t = 8)]
    gap: u32,
    /// Simulated rasterization cost per tile
    #[arg(long, default_value_t = 2)]
    render_delay_ms: u64,
    #[arg(long, default_value = "pagetiles.log")]
    log_file: PathBuf,
    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

/// Document with letter-sized pages, every fourth one landscape
struct SyntheticDocument {
    sizes: Vec<(f32, f32)>,
}

impl SyntheticDocument {
    fn new(pages: usize, width: f32, height: f32) -> Self {
        let sizes = (0..pages)
            .map(|i| if i % 4 == 3 { (height, width) } else { (width, height) })
            .collect();
        Self { sizes }
    }
}

impl DocumentModel for SyntheticDocument {
    fn page_count(&self) -> usize {
        self.sizes.len()
    }

    fn page_size(&self, index: usize) -> Option<(f32, f32)> {
        self.sizes.get(index).copied()
    }
}

/// Paints tiles in a checkerboard so neighbours are told apart
struct CheckerRasterizer {
    delay: Duration,
    cell: u32,
}

impl pagetiles::Rasterizer for CheckerRasterizer {
    fn render_rect(&self, job: &RenderJob) -> Result<Bitmap, RenderFault> {
        if job.pixel_rect.is_empty() {
            return Err(RenderFault::rasterizer("empty tile"));
        }
        std::thread::sleep(self.delay);
        let parity = (job.pixel_rect.x / self.cell + job.pixel_rect.y / self.cell) % 2;
        let shade = if parity == 0 { 0xf0 } else { 0xc8 };
        Ok(Bitmap::filled(
            job.pixel_rect.width,
            job.pixel_rect.height,
            [shade, shade, shade, 0xff],
        ))
    }
}

#[derive(Clone, Copy, Debug)]
enum Step {
    Show,
    Scroll(ScrollDirection, u32),
    ZoomIn(u32),
    ZoomOut(u32),
    Rotate,
    Invalidate(usize),
    JumpTo(usize),
}

fn script(pages: usize) -> Vec<Step> {
    vec![
        Step::Show,
        Step::Scroll(ScrollDirection::Down, 6),
        Step::ZoomIn(3),
        Step::Scroll(ScrollDirection::Right, 2),
        Step::Rotate,
        Step::Invalidate(0),
        Step::ZoomOut(3),
        Step::JumpTo(pages / 2),
        Step::Scroll(ScrollDirection::Up, 3),
    ]
}

struct Simulation {
    service: TileService,
    document: DocumentId,
    sizes: Vec<(f32, f32)>,
    viewport: Viewport,
    gap: u32,
    view: ViewportState,
    cache: BitmapCache,
}

impl Simulation {
    fn run_step(&mut self, step: Step) -> Result<()> {
        match step {
            Step::Show => self.push_snapshot()?,
            Step::Scroll(direction, times) => {
                for _ in 0..times {
                    self.view.pan(direction);
                    self.push_snapshot()?;
                }
            }
            Step::ZoomIn(times) | Step::ZoomOut(times) => {
                for _ in 0..times {
                    if matches!(step, Step::ZoomIn(_)) {
                        self.view.step_in();
                    } else {
                        self.view.step_out();
                    }
                }
                self.service.set_scale(self.document, self.view.factor())?;
                self.push_snapshot()?;
            }
            Step::Rotate => {
                self.view.rotate_cw();
                self.service.set_rotation(self.document, self.view.rotation)?;
                self.push_snapshot()?;
            }
            Step::Invalidate(page) => {
                self.service.invalidate(self.document, &[page])?;
                self.cache.invalidate_page(page);
            }
            Step::JumpTo(page) => {
                self.view.scroll_to_page(page, &self.sizes, self.gap);
                self.push_snapshot()?;
            }
        }
        self.render()
    }

    /// Report the current viewport and let the throttle window close
    fn push_snapshot(&mut self) -> Result<()> {
        let snapshot = self.view.visible_pages(&self.sizes, self.viewport, self.gap);
        debug!("Snapshot covers {} page(s)", snapshot.len());
        let now = Instant::now();
        self.service.scroll(self.document, snapshot, now)?;
        self.service.tick(now + self.service.config().scroll_throttle);
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        let requested = self.service.render_pending(self.document)?;
        debug!("Requested {} tile render(s)", requested.len());

        let deadline = Instant::now() + Duration::from_secs(30);
        while self.service.in_flight_count() > 0 && Instant::now() < deadline {
            for completion in self.service.wait_renders(Duration::from_millis(100)) {
                match completion {
                    Completion::Ready {
                        page_index,
                        tile_id,
                        bitmap,
                        ..
                    } => self.cache.insert(CacheKey::new(page_index, tile_id), bitmap),
                    Completion::Failed { tile_id, error, .. } => {
                        warn!("Tile {tile_id} failed: {error}");
                    }
                    Completion::Cancelled { .. } => {}
                }
            }
            self.service.tick(Instant::now());
        }

        let tiles = self.service.tiles(self.document)?;
        let evicted = self.cache.retain_tile_set(&tiles);
        if evicted > 0 {
            debug!("Evicted {evicted} retired bitmap(s)");
        }
        Ok(())
    }

    fn report(&self, step: Step) -> Result<()> {
        let TileStats {
            pages,
            pending,
            rendering,
            ready,
            fallback,
        } = self.service.stats(self.document)?;
        let (scale, rotation) = self.service.view(self.document)?;
        println!(
            "{:<28} scale {scale:>5.2} rot {:>3}° | {pages:>2} page(s) {pending:>3} pending {rendering:>3} rendering {ready:>4} ready {fallback:>3} fallback | cache {} ({} KiB)",
            format!("{step:?}"),
            rotation.degrees(),
            self.cache.len(),
            self.cache.byte_size() / 1024,
        );
        Ok(())
    }
}

fn load(cli: &Cli) -> Settings {
    match &cli.config {
        Some(path) => settings::load_settings_from_path(path),
        None => settings::load_settings(),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    WriteLogger::init(
        cli.log_level,
        Config::default(),
        File::create(&cli.log_file)
            .with_context(|| format!("creating log file {:?}", cli.log_file))?,
    )?;

    info!("Starting pagetiles simulation");
    let settings = load(&cli);
    debug!("Settings: {settings:?}");

    let rasterizer = Arc::new(CheckerRasterizer {
        delay: Duration::from_millis(cli.render_delay_ms),
        cell: settings.tiling.tile_size.max(1),
    });
    let service = TileService::with_config(rasterizer, settings.service_config());
    let document = DocumentId(1);
    let model = SyntheticDocument::new(cli.pages, cli.page_width, cli.page_height);
    let sizes = model.sizes.clone();
    service.open_document(document, Arc::new(model), settings.tiling)?;
    let updates = service.subscribe(document)?;

    let mut sim = Simulation {
        service,
        document,
        sizes,
        viewport: Viewport {
            width: cli.viewport_width,
            height: cli.viewport_height,
        },
        gap: cli.gap,
        view: ViewportState::default(),
        cache: BitmapCache::new(settings.bitmap_cache_size),
    };

    for step in script(cli.pages) {
        sim.run_step(step)?;
        sim.report(step)?;
    }

    let notifications = updates.receiver().try_iter().count();
    sim.service.close_document(document)?;
    println!("{notifications} tile set update(s) delivered");
    info!("Shutting down pagetiles simulation");
    Ok(())
}
