use crate::models::{DeviceClass, PlaylistInfo, Song, Tag};
use time::OffsetDateTime;

pub(crate) const FORMAT_VERSION: u32 = 1;

#[derive(facet::Facet)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub(crate) struct DatabaseFile {
    #[facet(rename = "v")]
    pub version: u32,
    #[facet(rename = "d")]
    pub directories: Vec<DirectoryRecord>,
}

/// One directory, flattened: its URI locates it in the tree.
#[derive(facet::Facet)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub(crate) struct DirectoryRecord {
    #[facet(rename = "u")]
    pub uri: String,
    #[facet(rename = "m")]
    pub mtime: i64,
    #[facet(rename = "mn", default)]
    pub mtime_nanos: u32,
    #[facet(rename = "i")]
    pub inode: u64,
    #[facet(rename = "dv")]
    pub device: u64,
    #[facet(rename = "c")]
    pub class: DeviceClassProxy,
    #[facet(rename = "s")]
    pub songs: Vec<SongProxy>,
    #[facet(rename = "p")]
    pub playlists: Vec<PlaylistProxy>,
}

#[derive(facet::Facet)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub(crate) struct SongProxy {
    #[facet(rename = "n")]
    name: String,
    #[facet(rename = "m")]
    mtime: i64,
    #[facet(rename = "mn", default)]
    mtime_nanos: u32,
    #[facet(rename = "t")]
    tag: TagProxy,
    #[facet(rename = "x", default, transparent, skip_serializing_if = Option::is_none)]
    target: Option<String>,
}
impl From<&Song> for SongProxy {
    fn from(song: &Song) -> Self {
        let (mtime, mtime_nanos) = split_timestamp(song.mtime);
        Self {
            name: song.name.clone(),
            mtime,
            mtime_nanos,
            tag: (&song.tag).into(),
            target: song.target.clone(),
        }
    }
}
impl SongProxy {
    pub fn into_song(self) -> Option<Song> {
        let mut song = Song::new(self.name, timestamp(self.mtime, self.mtime_nanos)?).with_tag(self.tag.into());
        song.target = self.target;
        Some(song)
    }
}

#[derive(facet::Facet)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub(crate) struct TagProxy {
    #[facet(rename = "t", default, transparent, skip_serializing_if = Option::is_none)]
    title: Option<String>,
    #[facet(rename = "a", default, transparent, skip_serializing_if = Option::is_none)]
    artist: Option<String>,
    #[facet(rename = "b", default, transparent, skip_serializing_if = Option::is_none)]
    album: Option<String>,
    #[facet(rename = "n", default, transparent, skip_serializing_if = Option::is_none)]
    track: Option<u32>,
    #[facet(rename = "d", default, transparent, skip_serializing_if = Option::is_none)]
    duration_ms: Option<u64>,
}
impl From<&Tag> for TagProxy {
    fn from(tag: &Tag) -> Self {
        Self {
            title: tag.title.clone(),
            artist: tag.artist.clone(),
            album: tag.album.clone(),
            track: tag.track,
            duration_ms: tag.duration_ms,
        }
    }
}
impl From<TagProxy> for Tag {
    fn from(tag: TagProxy) -> Self {
        Self {
            title: tag.title,
            artist: tag.artist,
            album: tag.album,
            track: tag.track,
            duration_ms: tag.duration_ms,
        }
    }
}

#[derive(facet::Facet)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub(crate) struct PlaylistProxy {
    #[facet(rename = "n")]
    name: String,
    #[facet(rename = "m")]
    mtime: i64,
    #[facet(rename = "mn", default)]
    mtime_nanos: u32,
}
impl From<&PlaylistInfo> for PlaylistProxy {
    fn from(playlist: &PlaylistInfo) -> Self {
        let (mtime, mtime_nanos) = split_timestamp(playlist.mtime);
        Self {
            name: playlist.name.clone(),
            mtime,
            mtime_nanos,
        }
    }
}
impl PlaylistProxy {
    pub fn into_playlist(self) -> Option<PlaylistInfo> {
        Some(PlaylistInfo::new(self.name, timestamp(self.mtime, self.mtime_nanos)?))
    }
}

/// Mount points are never persisted, so there is no variant for them.
#[repr(u8)]
#[derive(facet::Facet)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub(crate) enum DeviceClassProxy {
    R,
    C,
    A,
    P,
}
impl DeviceClassProxy {
    pub fn from_class(class: DeviceClass) -> Option<Self> {
        match class {
            DeviceClass::Regular => Some(Self::R),
            DeviceClass::Container => Some(Self::C),
            DeviceClass::Archive => Some(Self::A),
            DeviceClass::Playlist => Some(Self::P),
            DeviceClass::Mount => None,
        }
    }
}
impl From<DeviceClassProxy> for DeviceClass {
    fn from(class: DeviceClassProxy) -> Self {
        match class {
            DeviceClassProxy::R => Self::Regular,
            DeviceClassProxy::C => Self::Container,
            DeviceClassProxy::A => Self::Archive,
            DeviceClassProxy::P => Self::Playlist,
        }
    }
}

/// Whole seconds and the nanoseconds within that second. Storage reports
/// sub-second mtimes, and comparing against a truncated copy would make
/// every file look changed after a reload.
pub(crate) fn split_timestamp(time: OffsetDateTime) -> (i64, u32) {
    (time.unix_timestamp(), time.nanosecond())
}

pub(crate) fn timestamp(seconds: i64, nanos: u32) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(seconds).ok()?.replace_nanosecond(nanos).ok()
}
