//! HTTP request handlers.

mod batch;
mod helpers;
mod pipeline;
mod results;

pub use batch::{batch_action, batch_status, download_results, submit_batch, upload};
pub use pipeline::{init, logs, pause, resume, start, status, stop};
pub use results::{download_all_images, extract, image_dates, save_and_extract};
