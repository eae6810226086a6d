pub mod args;
pub mod config;
pub mod metrics;
pub mod report;
pub mod rng;
pub mod schedule;
pub mod visualization;

pub use args::{DeviceSelector, TrainArgs};
pub use config::{load_or_init, write_json};
pub use metrics::{EpochMetrics, MetricSeries};
pub use report::{Report, ReportSection, DEFAULT_REPORT_TEMPLATE};
pub use rng::{seeded_rng, stream_rng, RngStream};
pub use schedule::MultiStepSchedule;
pub use visualization::encode_planar_png_data_url;
