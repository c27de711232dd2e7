use crate::backend::{ImageBackend, MaterializeRequest};
use crate::RuntimeError;
use chrono::Utc;
use kiln_schema::{BuildPlan, BuilderKind, ImageBuildResult, ImageId, ImageTag};
use kiln_store::{
    pack_layer, BuildLayout, ImageRecord, ImageStore, LayerOptions, LayerRecord, ObjectStore,
    Ownership, StoreError, StoreLayout,
};
use std::path::Path;
use tracing::{debug, info};

/// Assembles images from layer directories without an external engine.
///
/// Each layer is packed into a deterministic archive and stored by content;
/// the image record lists the layer digests in plan order.
pub struct DirectBackend {
    layout: StoreLayout,
}

impl DirectBackend {
    pub fn new(store_root: &Path) -> Self {
        Self {
            layout: StoreLayout::new(store_root),
        }
    }

    fn images(&self) -> ImageStore {
        ImageStore::new(self.layout.clone())
    }
}

impl ImageBackend for DirectBackend {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Direct
    }

    fn name(&self) -> &str {
        "direct"
    }

    fn available(&self) -> bool {
        true
    }

    fn default_user(&self, _base_reference: &str) -> Result<String, RuntimeError> {
        Ok("root".to_owned())
    }

    fn materialize(
        &self,
        plan: &BuildPlan,
        layout: &BuildLayout,
        request: &MaterializeRequest,
    ) -> Result<ImageBuildResult, RuntimeError> {
        let BuildPlan::Direct(plan) = plan else {
            return Err(RuntimeError::PlanMismatch {
                backend: BuilderKind::Direct,
                plan: plan.kind(),
            });
        };
        self.layout.initialize()?;
        let objects = ObjectStore::new(self.layout.clone());

        let mut layers = Vec::with_capacity(plan.layers.len());
        for descriptor in &plan.layers {
            let source = layout.root().join(&descriptor.source);
            // An empty directory is a valid, empty layer.
            if !source.is_dir() {
                return Err(StoreError::MissingLayer {
                    ordinal: descriptor.ordinal,
                    path: source,
                }
                .into());
            }
            let options = LayerOptions {
                destination: descriptor.destination.clone(),
                ownership: Ownership::parse(descriptor.ownership.as_deref())?,
                permissions: descriptor.permissions,
            };
            let data = pack_layer(&source, &options)?;
            let digest = objects.put(&data)?;
            debug!(
                "layer {} -> {} ({} bytes)",
                descriptor.ordinal,
                &digest[..12],
                data.len()
            );
            layers.push(LayerRecord {
                ordinal: descriptor.ordinal,
                digest,
                size: data.len() as u64,
                destination: descriptor.destination.clone(),
            });
        }

        let record = ImageRecord {
            base: plan.base.clone(),
            layers,
            env: plan.env.clone(),
            user: plan.user.clone(),
            healthcheck: plan.healthcheck.clone(),
        };
        let image_id = self.images().put(&record, &request.tag)?;
        info!("assembled {} as {}", request.tag, image_id.short());

        Ok(ImageBuildResult {
            tag: request.tag.clone(),
            image_id,
            builder: BuilderKind::Direct,
            created_at: Utc::now(),
        })
    }

    fn image_exists(&self, id: &ImageId) -> Result<bool, RuntimeError> {
        Ok(self.images().exists(id))
    }

    fn remove(&self, tag: &str) -> Result<String, RuntimeError> {
        if self.images().untag(tag)? {
            Ok(String::new())
        } else {
            Ok(format!("No such image: {tag}"))
        }
    }

    fn list_images(&self) -> Result<Vec<ImageTag>, RuntimeError> {
        Ok(self.images().list()?.into_iter().map(|e| e.tag).collect())
    }
}
