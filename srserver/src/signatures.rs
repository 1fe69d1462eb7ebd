use std::sync::Arc;

use log::info;
use oci_spec::image::Digest;
use serde::{Deserialize, Serialize};

use crate::errors::DistError;
use crate::repository::App;
use srmeta::{ImageSignature, MetaError};

// signatures ride on the image record in the metadata plane, the registry
// only relays them. content is base64 on the wire

#[derive(Debug, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    pub signatures: Vec<SignatureItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignatureItem {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub content: String,
}

pub struct SignatureService {
    app: Arc<App>,
}

impl SignatureService {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    pub async fn get(&self, digest: &Digest) -> Result<SignatureEnvelope, DistError> {
        let image = match self.app.meta.get_image(&digest.to_string()).await {
            Ok(image) => image,
            Err(MetaError::NotFound { .. }) => return Err(DistError::manifest_unknown()),
            Err(e) => return Err(e.into()),
        };
        use base64::Engine as _;
        let engine = base64::engine::general_purpose::STANDARD;
        Ok(SignatureEnvelope {
            signatures: image
                .signatures
                .iter()
                .map(|s| SignatureItem {
                    name: s.name.clone(),
                    kind: s.kind.clone(),
                    content: engine.encode(&s.content),
                })
                .collect(),
        })
    }

    pub async fn put(&self, digest: &Digest, item: SignatureItem) -> Result<(), DistError> {
        let mut image = match self.app.meta.get_image(&digest.to_string()).await {
            Ok(image) => image,
            Err(MetaError::NotFound { .. }) => return Err(DistError::manifest_unknown()),
            Err(e) => return Err(e.into()),
        };
        if image.signatures.iter().any(|s| s.name == item.name) {
            // same name means same signature, nothing to do
            return Ok(());
        }
        use base64::Engine as _;
        let content = base64::engine::general_purpose::STANDARD
            .decode(&item.content)
            .map_err(|_| {
                DistError::new(crate::errors::Code::ManifestInvalid, "signature content is not base64")
            })?;
        image.signatures.push(ImageSignature {
            name: item.name.clone(),
            content,
            kind: item.kind,
        });
        match self.app.meta.update_image(image).await {
            Ok(_) => {
                info!("stored signature {} for {}", item.name, digest);
                Ok(())
            }
            Err(e) if e.is_access_denied() => Err(DistError::denied()),
            Err(e) => Err(e.into()),
        }
    }
}
