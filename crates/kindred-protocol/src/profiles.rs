//! Profile payloads (`/users/profiles/`, `/users/photos/`).

use serde::{Deserialize, Serialize};

/// Gender code stored on a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "NB")]
    NonBinary,
    #[serde(rename = "O")]
    Other,
}

/// Which genders a user wants to see in their feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenderPreference {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "A")]
    Any,
}

/// A profile photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    #[serde(deserialize_with = "crate::deserialize_id")]
    pub id: String,
    /// Absolute image URL.
    pub image: String,
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub caption: Option<String>,
}

/// Profile as other users see it (feed cards, match partners).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicProfile {
    #[serde(deserialize_with = "crate::deserialize_id")]
    pub id: String,
    pub first_name: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub work: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub photos: Vec<Photo>,
    /// Rounded distance; absent when either side has no location.
    #[serde(default)]
    pub distance_km: Option<u32>,
}

impl PublicProfile {
    pub fn main_photo(&self) -> Option<&Photo> {
        self.photos.iter().find(|photo| photo.is_main)
    }
}

/// Coordinates of the signed-in user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

/// Profile of the signed-in user (`GET /users/profiles/me/`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentProfile {
    #[serde(deserialize_with = "crate::deserialize_id")]
    pub id: String,
    pub first_name: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub work: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub photos: Vec<Photo>,
    pub email: String,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub gender_preference: Option<GenderPreference>,
    #[serde(default)]
    pub max_distance: Option<u32>,
    #[serde(default)]
    pub min_age: Option<u32>,
    #[serde(default)]
    pub max_age: Option<u32>,
    #[serde(default)]
    pub location: Option<Location>,
}

impl CurrentProfile {
    pub fn main_photo(&self) -> Option<&Photo> {
        self.photos.iter().find(|photo| photo.is_main)
    }
}

/// Partial update for `PATCH /users/profiles/me/`. Unset fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender_preference: Option<GenderPreference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_distance: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl EditProfile {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
