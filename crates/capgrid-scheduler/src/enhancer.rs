//! Profile-driven description enhancement.
//!
//! A description names an instance type, an image and storage classes by
//! abstract names; a profile maps those names onto what one endpoint
//! actually offers. [`EnhancerChain`] runs a fixed sequence of stages over
//! a copy of the description. Any stage failure rejects the profile.

use std::sync::Arc;

use async_trait::async_trait;
use capgrid_state::{
    Endpoint, IMAGE_TYPE_PROPERTY, PROFILE_LINK_PROPERTY, Profile, ResourceDescription, StateStore,
};
use tracing::debug;

use crate::collaborators::{CollaboratorResult, DescriptionEnhancer};
use crate::error::CollaboratorError;

/// One step of description completion.
pub trait EnhancementStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        profile: &Profile,
        endpoint: Option<&Endpoint>,
        desc: &mut ResourceDescription,
    ) -> Result<(), String>;
}

/// Stamps the profile link and the endpoint's region.
pub struct ProfileStage;

impl EnhancementStage for ProfileStage {
    fn name(&self) -> &'static str {
        "profile"
    }

    fn apply(
        &self,
        profile: &Profile,
        endpoint: Option<&Endpoint>,
        desc: &mut ResourceDescription,
    ) -> Result<(), String> {
        if let Some(endpoint) = endpoint {
            if !profile.serves(endpoint) {
                return Err(format!("{} does not serve {}", profile.id, endpoint.id));
            }
            if desc.region_id.is_none() {
                desc.region_id = endpoint.region_id.clone();
            }
        }
        desc.custom_properties
            .insert(PROFILE_LINK_PROPERTY.to_string(), profile.id.clone());
        Ok(())
    }
}

/// Resolves the instance type name to cpu and memory.
pub struct InstanceTypeStage;

impl EnhancementStage for InstanceTypeStage {
    fn name(&self) -> &'static str {
        "instance type"
    }

    fn apply(
        &self,
        profile: &Profile,
        _endpoint: Option<&Endpoint>,
        desc: &mut ResourceDescription,
    ) -> Result<(), String> {
        let Some(instance_type) = &desc.instance_type else {
            return Ok(());
        };
        let spec = profile
            .instance_types
            .get(instance_type)
            .ok_or_else(|| format!("instance type {instance_type} not defined"))?;
        desc.cpu_count = spec.cpu_count;
        desc.total_memory_bytes = spec.memory_bytes;
        Ok(())
    }
}

/// Resolves the `imageType` property to a provider image id.
pub struct ImageStage;

impl EnhancementStage for ImageStage {
    fn name(&self) -> &'static str {
        "image"
    }

    fn apply(
        &self,
        profile: &Profile,
        _endpoint: Option<&Endpoint>,
        desc: &mut ResourceDescription,
    ) -> Result<(), String> {
        let Some(image) = desc.custom_properties.remove(IMAGE_TYPE_PROPERTY) else {
            return Ok(());
        };
        let image_id = profile
            .images
            .get(&image)
            .ok_or_else(|| format!("image {image} not available"))?;
        desc.image_id = Some(image_id.clone());
        Ok(())
    }
}

/// Fills and checks disk storage classes.
pub struct DiskStage;

impl EnhancementStage for DiskStage {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn apply(
        &self,
        profile: &Profile,
        _endpoint: Option<&Endpoint>,
        desc: &mut ResourceDescription,
    ) -> Result<(), String> {
        for disk in &mut desc.disks {
            if disk.storage_class.is_none() {
                disk.storage_class = profile.default_storage_class.clone();
            }
            if let Some(class) = &disk.storage_class {
                if !profile.storage_classes.contains(class) {
                    return Err(format!("storage class {class} of disk {} not offered", disk.name));
                }
            }
        }
        Ok(())
    }
}

/// Store-backed enhancer running the standard stages in order.
pub struct EnhancerChain {
    store: StateStore,
    stages: Vec<Arc<dyn EnhancementStage>>,
}

impl EnhancerChain {
    pub fn new(store: StateStore, stages: Vec<Arc<dyn EnhancementStage>>) -> Self {
        Self { store, stages }
    }

    pub fn standard(store: StateStore) -> Self {
        Self::new(
            store,
            vec![
                Arc::new(ProfileStage),
                Arc::new(InstanceTypeStage),
                Arc::new(ImageStage),
                Arc::new(DiskStage),
            ],
        )
    }
}

#[async_trait]
impl DescriptionEnhancer for EnhancerChain {
    async fn enhance(
        &self,
        profile_link: &str,
        mut desc: ResourceDescription,
    ) -> CollaboratorResult<ResourceDescription> {
        let profile = self
            .store
            .get_profile(profile_link)?
            .ok_or_else(|| CollaboratorError::NotFound(profile_link.to_string()))?;
        let endpoint = match desc.endpoint_link() {
            Some(link) => self.store.get_endpoint(link)?,
            None => None,
        };

        for stage in &self.stages {
            stage
                .apply(&profile, endpoint.as_ref(), &mut desc)
                .map_err(|e| CollaboratorError::Rejected(format!("{}: {e}", stage.name())))?;
        }
        debug!(profile = %profile_link, description = %desc.id, "description enhanced");
        Ok(desc)
    }
}
