//! `rigger check-image`

use anyhow::{bail, Result};
use rigger_core::events::EventLog;
use rigger_core::image::ImageValidator;
use rigger_core::settings::Settings;

/// Validator configured from the `[docker]` settings
pub fn validator(settings: &Settings, events: EventLog) -> ImageValidator {
    ImageValidator::new(settings.docker.registry_alias.clone(), events)
        .with_allow_list(settings.docker.allowed_images.iter())
}

/// Resolve `image` the way a build would; the error lists what is allowed
pub fn execute(settings: &Settings, image: &str) -> Result<String> {
    let validator = validator(settings, EventLog::silent());
    match validator.validate(image) {
        Some(resolved) => Ok(resolved),
        None => bail!(
            "Docker image {} is not allowed. Allowed images: {}",
            image,
            validator.allowed_combinations().join(", ")
        ),
    }
}
