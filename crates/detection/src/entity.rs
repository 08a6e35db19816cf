//! Borrowed view of the entity a policy is evaluated against.

use std::borrow::Cow;

use stackwatch_core::{AlertDeployment, AlertEntity, AlertImage, Container, Deployment, Image, ProcessIndicator};

/// The three shapes of entity the engine evaluates, resolved once at the
/// detector boundary.
#[derive(Debug, Clone, Copy)]
pub enum EntityRef<'a> {
    /// Build time: a single image.
    Image(&'a Image),
    /// Deploy time: a deployment together with the images its containers run.
    Deployment {
        deployment: &'a Deployment,
        images: &'a [Image],
    },
    /// Runtime: a process event inside a deployment.
    Process {
        deployment: &'a Deployment,
        images: &'a [Image],
        indicator: &'a ProcessIndicator,
    },
}

/// One container (absent at build time) paired with the image it runs.
pub struct RunningImage<'a> {
    pub container: Option<&'a Container>,
    pub image: Cow<'a, Image>,
}

impl<'a> EntityRef<'a> {
    pub fn deployment(&self) -> Option<&'a Deployment> {
        match self {
            EntityRef::Image(_) => None,
            EntityRef::Deployment { deployment, .. } | EntityRef::Process { deployment, .. } => {
                Some(deployment)
            }
        }
    }

    pub fn image(&self) -> Option<&'a Image> {
        match self {
            EntityRef::Image(image) => Some(image),
            _ => None,
        }
    }

    pub fn indicator(&self) -> Option<&'a ProcessIndicator> {
        match self {
            EntityRef::Process { indicator, .. } => Some(indicator),
            _ => None,
        }
    }

    /// Containers of the underlying deployment; empty for images.
    pub fn containers(&self) -> &'a [Container] {
        self.deployment()
            .map(|d| d.containers.as_slice())
            .unwrap_or(&[])
    }

    /// Id of the entity alerts are keyed on.
    pub fn id(&self) -> &'a str {
        match self {
            EntityRef::Image(image) => &image.id,
            EntityRef::Deployment { deployment, .. } | EntityRef::Process { deployment, .. } => {
                &deployment.id
            }
        }
    }

    /// Human-readable identity used in error context.
    pub fn describe(&self) -> String {
        match self {
            EntityRef::Image(image) => format!("image {} ({})", image.name, image.id),
            EntityRef::Deployment { deployment, .. } => {
                format!("deployment {} ({})", deployment.name, deployment.id)
            }
            EntityRef::Process {
                deployment,
                indicator,
                ..
            } => format!(
                "process {} in deployment {} ({})",
                indicator.signal.name, deployment.name, deployment.id
            ),
        }
    }

    /// Snapshot stored on alerts raised against this entity.
    pub fn to_alert_entity(&self) -> AlertEntity {
        match self {
            EntityRef::Image(image) => AlertEntity::Image(AlertImage::from(*image)),
            EntityRef::Deployment { deployment, .. } | EntityRef::Process { deployment, .. } => {
                AlertEntity::Deployment(AlertDeployment::from(*deployment))
            }
        }
    }

    /// Every image the entity runs, paired with its container.
    ///
    /// Containers whose image is missing from the supplied image list are
    /// evaluated against an image built from the container's reference.
    pub fn container_images(&self) -> Vec<RunningImage<'a>> {
        match self {
            EntityRef::Image(image) => vec![RunningImage {
                container: None,
                image: Cow::Borrowed(*image),
            }],
            EntityRef::Deployment {
                deployment, images, ..
            }
            | EntityRef::Process {
                deployment, images, ..
            } => deployment
                .containers
                .iter()
                .map(|container| RunningImage {
                    container: Some(container),
                    image: resolve_image(container, images),
                })
                .collect(),
        }
    }
}

fn resolve_image<'a>(container: &Container, images: &'a [Image]) -> Cow<'a, Image> {
    let by_id = container
        .image
        .id
        .as_deref()
        .and_then(|id| images.iter().find(|i| i.id == id));
    let found = by_id.or_else(|| {
        images
            .iter()
            .find(|i| i.name.full_name == container.image.name.full_name)
    });
    match found {
        Some(image) => Cow::Borrowed(image),
        None => Cow::Owned(Image::from_name(
            container.image.id.clone().unwrap_or_default(),
            container.image.name.clone(),
        )),
    }
}
