//! Display sink rendering into a native bitmap
//!
//! Pictures arriving on input 0 are scaled (keeping their aspect ratio,
//! centered) into the attached RGB565 render target. Input 1 carries the
//! local preview of a two-way call; this sink does not draw it.

use std::sync::Arc;

use crate::error::FilterError;
use crate::filter::{
    Filter, FilterCategory, FilterDesc, FilterId, FilterMethod, MethodReply, ProcessContext,
};
use crate::video::{
    fit_centered, PixelFormat, PlatformContext, RenderTarget, ScaleContext, TargetInfo,
    VideoGeometry,
};

static DESC: FilterDesc = FilterDesc {
    id: FilterId::Display,
    name: "Display",
    category: FilterCategory::Sink,
    ninputs: 2,
    noutputs: 0,
};

struct AttachedTarget {
    target: Arc<dyn RenderTarget>,
    info: TargetInfo,
}

pub struct DisplayFilter {
    platform: Arc<dyn PlatformContext>,
    target: Option<AttachedTarget>,
    vsize: VideoGeometry,
    sws: Option<ScaleContext>,
    rendered: u64,
    skipped: u64,
}

impl DisplayFilter {
    pub fn new(platform: Arc<dyn PlatformContext>) -> Self {
        Self {
            platform,
            target: None,
            vsize: VideoGeometry::CIF,
            sws: None,
            rendered: 0,
            skipped: 0,
        }
    }

    /// Id of the cached conversion context, if any
    pub fn conversion_context_id(&self) -> Option<u64> {
        self.sws.as_ref().map(|c| c.id())
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    /// Pictures drawn so far
    pub fn rendered(&self) -> u64 {
        self.rendered
    }

    /// Ticks skipped because the target could not be locked
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn set_target(&mut self, target: Option<Arc<dyn RenderTarget>>) -> Result<MethodReply, FilterError> {
        self.target = None;
        let Some(target) = target else {
            tracing::info!("Render target detached");
            return Ok(MethodReply::Done);
        };

        if let Err(e) = self.platform.attach_current_thread() {
            tracing::error!("Could not attach to {} platform: {}", self.platform.name(), e);
            return Err(e);
        }
        let info = target.info().map_err(|e| {
            tracing::error!("Failed to query render target: {}", e);
            e
        })?;
        if info.format != PixelFormat::Rgb565 || (info.stride as u64) < info.width as u64 * 2 {
            tracing::error!("Unsupported render target {:?}", info);
            return Err(FilterError::RenderTarget(format!(
                "unsupported layout {:?} stride {}",
                info.format, info.stride
            )));
        }

        tracing::info!(
            "New render target given with w={},h={},stride={}",
            info.width,
            info.height,
            info.stride
        );
        self.target = Some(AttachedTarget { target, info });
        Ok(MethodReply::Done)
    }
}

impl Filter for DisplayFilter {
    fn desc(&self) -> &'static FilterDesc {
        &DESC
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        let Some(attached) = self.target.as_ref() else {
            return Ok(());
        };
        let Some(unit) = ctx.take_last(0) else {
            return Ok(());
        };
        let Some(geometry) = unit.geometry() else {
            return Ok(());
        };

        if geometry != self.vsize {
            tracing::debug!(
                "Picture size changed to {}x{}",
                geometry.width,
                geometry.height
            );
            self.vsize = geometry;
            self.sws = None;
        }

        let info = attached.info;
        let rect = fit_centered((info.width, info.height), (geometry.width, geometry.height));
        if rect.width == 0 || rect.height == 0 {
            return Ok(());
        }

        if let Some(sws) = &self.sws {
            if !sws.matches(&geometry, rect.width, rect.height) {
                self.sws = None;
            }
        }
        let sws = match self.sws.take() {
            Some(sws) => sws,
            None => ScaleContext::new(geometry, rect.width, rect.height)?,
        };

        let result = match attached.target.lock_pixels() {
            Ok(mut pixels) => {
                let drawn = sws.scale_into(&unit.data, &mut pixels, info.stride as usize, rect.x, rect.y);
                if drawn.is_ok() {
                    self.rendered += 1;
                }
                drawn
            }
            Err(e) => {
                tracing::warn!("Failed to lock render target pixels: {}", e);
                self.skipped += 1;
                Ok(())
            }
        };
        self.sws = Some(sws);
        result
    }

    fn call(&mut self, method: FilterMethod) -> Result<MethodReply, FilterError> {
        match method {
            FilterMethod::SetRenderTarget(target) => self.set_target(target),
            FilterMethod::GetVideoSize => Ok(MethodReply::VideoSize(self.vsize)),
            other => Err(FilterError::MethodNotSupported {
                filter: DESC.name,
                method: other.name(),
            }),
        }
    }

    fn uninit(&mut self) {
        self.sws = None;
        self.target = None;
    }
}
