//! Profiles: the feed, the signed-in user's own profile, and photos.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tracing::{debug, info, instrument};

use kindred_protocol::profiles::{CurrentProfile, EditProfile, Photo, PublicProfile};

use crate::api::{ApiClient, ApiRequest, ApiResult, MultipartField};
use crate::chat::IdentityProvider;

const PROFILES_PATH: &str = "/users/profiles/";
const ME_PATH: &str = "/users/profiles/me/";
const PHOTOS_PATH: &str = "/users/photos/";

/// A photo to upload.
#[derive(Debug, Clone)]
pub struct PhotoUpload {
    pub file_name: String,
    pub mime: Option<String>,
    pub bytes: Bytes,
    pub is_main: bool,
    pub caption: Option<String>,
}

impl PhotoUpload {
    /// Read `path` into memory, guessing the content type from its extension.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "photo".to_string());
        let mime = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| match ext.to_ascii_lowercase().as_str() {
                "jpg" | "jpeg" => Some("image/jpeg"),
                "png" => Some("image/png"),
                "webp" => Some("image/webp"),
                "gif" => Some("image/gif"),
                _ => None,
            })
            .map(str::to_string);
        Ok(Self {
            file_name,
            mime,
            bytes: Bytes::from(bytes),
            is_main: false,
            caption: None,
        })
    }

    fn into_fields(self) -> Vec<MultipartField> {
        let mut fields = vec![
            MultipartField::File {
                name: "image".to_string(),
                file_name: self.file_name,
                mime: self.mime,
                bytes: self.bytes,
            },
            MultipartField::Text {
                name: "is_main".to_string(),
                value: self.is_main.to_string(),
            },
        ];
        if let Some(caption) = self.caption {
            fields.push(MultipartField::Text {
                name: "caption".to_string(),
                value: caption,
            });
        }
        fields
    }
}

/// Profile endpoints plus a cache of the signed-in user's profile.
///
/// The cached profile doubles as the current-user identity for chat.
#[derive(Debug)]
pub struct ProfileService {
    api: Arc<ApiClient>,
    me: RwLock<Option<CurrentProfile>>,
}

impl ProfileService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            me: RwLock::new(None),
        }
    }

    /// Profiles to swipe on, already filtered by the backend.
    #[instrument(skip(self))]
    pub async fn feed(&self) -> ApiResult<Vec<PublicProfile>> {
        let profiles: Vec<PublicProfile> = self.api.get_json(PROFILES_PATH).await?;
        debug!("Feed returned {} profiles", profiles.len());
        Ok(profiles)
    }

    /// Fetch the signed-in user's profile and cache it.
    #[instrument(skip(self))]
    pub async fn me(&self) -> ApiResult<CurrentProfile> {
        let profile: CurrentProfile = self.api.get_json(ME_PATH).await?;
        self.cache(profile.clone());
        Ok(profile)
    }

    /// Last fetched profile, if any.
    pub fn cached(&self) -> Option<CurrentProfile> {
        self.me
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a partial update. An empty update is a plain read.
    #[instrument(skip(self, edit))]
    pub async fn update_me(&self, edit: &EditProfile) -> ApiResult<CurrentProfile> {
        if edit.is_empty() {
            return self.me().await;
        }
        let profile: CurrentProfile = self.api.patch_json(ME_PATH, edit).await?;
        self.cache(profile.clone());
        info!("Profile updated");
        Ok(profile)
    }

    #[instrument(skip(self, upload), fields(file = %upload.file_name))]
    pub async fn upload_photo(&self, upload: PhotoUpload) -> ApiResult<Photo> {
        let request = ApiRequest::post(PHOTOS_PATH).multipart(upload.into_fields());
        let photo: Photo = self.api.send(&request).await?;
        info!("Uploaded photo {}", photo.id);
        self.invalidate();
        Ok(photo)
    }

    #[instrument(skip(self))]
    pub async fn delete_photo(&self, photo_id: &str) -> ApiResult<()> {
        let path = format!("{}{}/", PHOTOS_PATH, urlencoding::encode(photo_id));
        self.api.delete(&path).await?;
        info!("Deleted photo {}", photo_id);
        self.invalidate();
        Ok(())
    }

    /// Forget the cached profile (on logout).
    pub fn clear(&self) {
        self.invalidate();
    }

    fn cache(&self, profile: CurrentProfile) {
        *self.me.write().unwrap_or_else(PoisonError::into_inner) = Some(profile);
    }

    fn invalidate(&self) {
        *self.me.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl IdentityProvider for ProfileService {
    fn current_user_id(&self) -> Option<String> {
        self.me
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|profile| profile.id.clone())
    }
}
