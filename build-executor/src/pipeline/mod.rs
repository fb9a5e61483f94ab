// Pipeline Module
// Compiled pipeline definition, rulesets, substitution and image helpers

pub mod image;
pub mod models;
pub mod ruleset;
pub mod substitute;

pub use image::{is_privileged_image, privileged_images, ImageRef};
pub use models::{Container, Pipeline, Secret, SecretPull, Stage, StepSecret, INIT_NAME};
pub use ruleset::{Matcher, Operator, RuleData, Rules, Ruleset};
