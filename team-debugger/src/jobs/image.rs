// Debug info loading
//
// One load per image. The NotLoaded -> Loading transition happens under the
// team lock, so concurrent requests never schedule a second load.

use super::image_job_key;
use crate::debug_info::ImageDebugInfoProvider;
use crate::error::{DebuggerError, DebuggerResult};
use crate::image::ImageDebugInfoState;
use crate::team::Team;
use crate::types::ImageId;
use crate::worker::{Job, JobContext, JobKey, JobListener, Worker};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct LoadImageDebugInfoJob {
    team: Arc<Team>,
    image_id: ImageId,
    provider: Arc<dyn ImageDebugInfoProvider>,
}

impl LoadImageDebugInfoJob {
    /// Schedules a load unless one is running or the outcome is known.
    /// Returns the image's state after the call.
    pub fn schedule_if_necessary(
        worker: &Worker,
        team: &Arc<Team>,
        image_id: ImageId,
        provider: &Arc<dyn ImageDebugInfoProvider>,
        listener: Option<Arc<dyn JobListener>>,
    ) -> DebuggerResult<ImageDebugInfoState> {
        let state = team.with(|t| {
            let image = t
                .image(image_id)
                .ok_or_else(|| DebuggerError::NotFound(format!("image {}", image_id)))?;
            let state = image.debug_info_state();
            if state == ImageDebugInfoState::NotLoaded {
                t.set_image_debug_info_state(image_id, ImageDebugInfoState::Loading);
            }
            Ok::<_, DebuggerError>(state)
        })?;
        if state != ImageDebugInfoState::NotLoaded {
            return Ok(state);
        }

        let job = Arc::new(LoadImageDebugInfoJob {
            team: team.clone(),
            image_id,
            provider: provider.clone(),
        });
        if let Err(e) = worker.schedule_job(job, listener) {
            warn!("Failed to schedule debug info load for image {}: {}", image_id, e);
            team.with(|t| {
                t.set_image_debug_info(image_id, None, ImageDebugInfoState::Unavailable)
            });
            return Err(e);
        }
        Ok(ImageDebugInfoState::Loading)
    }
}

#[async_trait]
impl Job for LoadImageDebugInfoJob {
    fn key(&self) -> JobKey {
        image_job_key(self.image_id)
    }

    fn description(&self) -> String {
        format!("Loading debug info for image {}", self.image_id)
    }

    async fn run(&self, ctx: &JobContext) -> DebuggerResult<()> {
        let Some(info) = self
            .team
            .read(|t| t.image(self.image_id).map(|i| i.info().clone()))
        else {
            debug!("Image {} vanished before its debug info was loaded", self.image_id);
            return Ok(());
        };

        let result = self.provider.load_image_debug_info(&info).await;
        if ctx.is_aborted() {
            self.team.with(|t| {
                t.set_image_debug_info(self.image_id, None, ImageDebugInfoState::Unavailable)
            });
            return Err(DebuggerError::Aborted);
        }

        match result {
            Ok(Some(debug_info)) => {
                info!(
                    "Loaded debug info for {}: {} functions",
                    info.name,
                    debug_info.functions.len()
                );
                self.team.with(|t| {
                    t.set_image_debug_info(
                        self.image_id,
                        Some(Arc::new(debug_info)),
                        ImageDebugInfoState::Loaded,
                    )
                });
                Ok(())
            }
            Ok(None) => {
                info!("No debug info available for {}", info.name);
                self.team.with(|t| {
                    t.set_image_debug_info(self.image_id, None, ImageDebugInfoState::Unavailable)
                });
                Ok(())
            }
            Err(e) => {
                self.team.with(|t| {
                    t.set_image_debug_info(self.image_id, None, ImageDebugInfoState::Unavailable)
                });
                Err(e)
            }
        }
    }
}
