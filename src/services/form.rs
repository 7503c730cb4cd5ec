//! Rendering of the spawner form.

use std::sync::Arc;

use serde_derive::Serialize;
use tera::{Context as TeraContext, Tera};

use crate::config::Config;
use crate::constants::DROPDOWN_SENTINEL_VALUE;
use crate::errors::ControllerError;
use crate::models::gafaelfawr::GafaelfawrUser;
use crate::models::lab::LabSizeDefinition;
use crate::models::menu::MenuImages;

#[derive(Serialize)]
struct FormSize {
    name: String,
    description: String,
}

/// Renders the HTML spawner form from tera templates.
pub struct FormService {
    config: Arc<Config>,
    tera: Tera,
}

impl FormService {
    pub fn new(config: Arc<Config>) -> Result<Self, ControllerError> {
        let template_error = |error: tera::Error| ControllerError::InvalidConfig {
            path: "templates".to_string(),
            error: error.to_string(),
        };
        let mut tera = Tera::default();
        tera.add_raw_template("spawner.html", include_str!("../templates/spawner.html.tera"))
            .map_err(template_error)?;
        tera.add_raw_template("unavailable.html", include_str!("../templates/unavailable.html.tera"))
            .map_err(template_error)?;
        Ok(FormService { config, tera })
    }

    /// Render the spawner form for a user.
    ///
    /// Lab sizes larger than the user's quota are omitted. A user whose
    /// quota forbids spawning entirely, or who has no usable sizes, gets
    /// the unavailable page instead.
    pub fn spawner_form(
        &self,
        user: &GafaelfawrUser,
        images: &MenuImages,
    ) -> Result<String, ControllerError> {
        let render_error = |error: tera::Error| ControllerError::InvalidConfig {
            path: "templates".to_string(),
            error: error.to_string(),
        };

        let sizes: Vec<&LabSizeDefinition> = match user.notebook_quota() {
            Some(quota) => {
                let allowed: Vec<&LabSizeDefinition> = self
                    .config
                    .lab
                    .sizes
                    .iter()
                    .filter(|size| {
                        size.cpu <= quota.cpu
                            && size.memory_bytes().map(|memory| memory <= quota.memory_bytes()).unwrap_or(false)
                    })
                    .collect();
                if !quota.spawn || allowed.is_empty() {
                    return self.tera.render("unavailable.html", &TeraContext::new()).map_err(render_error);
                }
                allowed
            }
            None => self.config.lab.sizes.iter().collect(),
        };

        let default_size = self
            .config
            .lab
            .default_size
            .filter(|wanted| sizes.iter().any(|size| size.size == *wanted))
            .unwrap_or(sizes[0].size);

        let sizes: Vec<FormSize> = sizes
            .iter()
            .map(|size| FormSize {
                name: size.size.to_string(),
                description: size.description(),
            })
            .collect();

        let mut context = TeraContext::new();
        context.insert("dropdown_sentinel", DROPDOWN_SENTINEL_VALUE);
        context.insert("cached_images", &images.menu);
        context.insert("all_images", &images.dropdown);
        context.insert("sizes", &sizes);
        context.insert("default_size", &default_size.to_string());
        self.tera.render("spawner.html", &context).map_err(render_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::gafaelfawr::{GafaelfawrUserInfo, NotebookQuota, UserQuota};
    use crate::models::menu::MenuImage;

    fn test_config() -> Arc<Config> {
        let yaml = "
lab:
  sizes:
    - size: small
      cpu: 1.0
      memory: 2Gi
    - size: medium
      cpu: 2.0
      memory: 4Gi
    - size: huge
      cpu: 16.0
      memory: 64Gi
  defaultSize: medium
images:
  source:
    type: docker
    registry: lighthouse.ceres
    repository: library/sketchbook
gafaelfawr:
  baseUrl: https://lighthouse.ceres
";
        Arc::new(serde_yaml::from_str(yaml).unwrap())
    }

    fn user_with_quota(cpu: f64, memory: f64, spawn: bool) -> GafaelfawrUser {
        GafaelfawrUser {
            info: GafaelfawrUserInfo {
                username: "rachel".to_string(),
                name: None,
                uid: 1101,
                gid: 1101,
                groups: vec![],
                quota: Some(UserQuota {
                    api: Default::default(),
                    notebook: Some(NotebookQuota { cpu, memory, spawn }),
                }),
            },
            token: "token-of-affection".to_string(),
        }
    }

    fn test_menu() -> MenuImages {
        MenuImages {
            menu: vec![MenuImage {
                reference: "lighthouse.ceres/library/sketchbook:recommended".to_string(),
                name: "Recommended (Weekly 2077_46)".to_string(),
            }],
            dropdown: vec![MenuImage {
                reference: "lighthouse.ceres/library/sketchbook:w_2077_45".to_string(),
                name: "Weekly 2077_45".to_string(),
            }],
        }
    }

    #[test]
    fn test_form_rendering() {
        let form = FormService::new(test_config()).unwrap();
        let html = form.spawner_form(&user_with_quota(9.0, 27.0, true), &test_menu()).unwrap();
        assert!(html.contains("Recommended (Weekly 2077_46)"));
        assert!(html.contains("use_image_from_dropdown"));
        assert!(html.contains(r#"value="medium""#));
        // The huge size exceeds the quota and is filtered out.
        assert!(!html.contains(r#"value="huge""#));
        // The default size is preselected.
        assert!(html.contains(r#"value="medium""#));
        assert!(html.contains("Weekly 2077_45"));
    }

    #[test]
    fn test_no_spawn_quota() {
        let form = FormService::new(test_config()).unwrap();
        let html = form.spawner_form(&user_with_quota(9.0, 27.0, false), &test_menu()).unwrap();
        assert!(html.contains("not available"));

        // A quota too small for any size also gets the unavailable page.
        let html = form.spawner_form(&user_with_quota(0.5, 0.5, true), &test_menu()).unwrap();
        assert!(html.contains("not available"));
    }

    #[test]
    fn test_no_quota_gets_all_sizes() {
        let form = FormService::new(test_config()).unwrap();
        let mut user = user_with_quota(1.0, 1.0, true);
        user.info.quota = None;
        let html = form.spawner_form(&user, &test_menu()).unwrap();
        assert!(html.contains(r#"value="huge""#));
    }
}
