//! Named transcoding presets and ffmpeg argument construction.
//!
//! A preset is a bundle of encoder choices that lowers to an ordered ffmpeg
//! argument vector. The scheduler treats that vector as opaque; only the
//! capability pre-filter inspects it (for `_nvenc` codecs).

use once_cell::sync::Lazy;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TranscodePreset {
    pub id: &'static str,
    pub description: &'static str,
    pub codec: &'static str,
    pub resolution: Option<&'static str>,
    pub crf: Option<u32>,
    pub bitrate: Option<&'static str>,
    pub preset: Option<&'static str>,
    pub audio_codec: Option<&'static str>,
    pub audio_bitrate: Option<&'static str>,
}

impl TranscodePreset {
    /// Lower the preset into an ffmpeg argument vector.
    ///
    /// Software codecs carry quality as `-crf`, NVENC codecs as `-cq`; a
    /// preset without a CRF falls back to `-b:v`. A codec of `none` drops
    /// the video stream entirely (audio-extraction presets).
    pub fn to_ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        if self.codec == "none" {
            args.push("-vn".into());
        } else {
            args.push("-c:v".into());
            args.push(self.codec.into());
        }

        if let Some(resolution) = self.resolution {
            args.push("-vf".into());
            args.push(format!("scale={resolution}"));
        }

        if let (Some(crf), true) = (self.crf, self.codec != "none") {
            if self.codec.contains("_nvenc") {
                args.push("-cq".into());
            } else {
                args.push("-crf".into());
            }
            args.push(crf.to_string());
        } else if let Some(bitrate) = self.bitrate {
            args.push("-b:v".into());
            args.push(bitrate.into());
        }

        if let Some(preset) = self.preset {
            args.push("-preset".into());
            args.push(preset.into());
        }

        if let Some(audio_codec) = self.audio_codec {
            args.push("-c:a".into());
            args.push(audio_codec.into());
        }

        if let Some(audio_bitrate) = self.audio_bitrate {
            args.push("-b:a".into());
            args.push(audio_bitrate.into());
        }

        args
    }
}

macro_rules! preset {
    ($id:literal, $desc:literal, $codec:literal
     $(, resolution: $res:literal)?
     $(, crf: $crf:literal)?
     $(, bitrate: $bitrate:literal)?
     $(, preset: $speed:literal)?
     $(, audio_codec: $ac:literal)?
     $(, audio_bitrate: $ab:literal)? ) => {
        TranscodePreset {
            id: $id,
            description: $desc,
            codec: $codec,
            resolution: None $(.or(Some($res)))?,
            crf: None $(.or(Some($crf)))?,
            bitrate: None $(.or(Some($bitrate)))?,
            preset: None $(.or(Some($speed)))?,
            audio_codec: None $(.or(Some($ac)))?,
            audio_bitrate: None $(.or(Some($ab)))?,
        }
    };
}

/// Catalog order is presentation order for `--list-presets`.
static PRESETS: Lazy<Vec<TranscodePreset>> = Lazy::new(|| {
    vec![
        preset!("1080p_h264_high", "1920x1080 H.264, high quality, widely compatible", "libx264",
            resolution: "1920:1080", crf: 18, preset: "slow",
            audio_codec: "aac", audio_bitrate: "128k"),
        preset!("1080p_h264_standard", "1920x1080 H.264, balanced quality and size", "libx264",
            resolution: "1920:1080", crf: 23, preset: "medium",
            audio_codec: "aac", audio_bitrate: "128k"),
        preset!("720p_h264", "1280x720 H.264, suited for network streaming", "libx264",
            resolution: "1280:720", crf: 23, preset: "medium",
            audio_codec: "aac", audio_bitrate: "128k"),
        preset!("480p_h264", "854x480 H.264, small files for quick transfer", "libx264",
            resolution: "854:480", crf: 28, preset: "fast",
            audio_codec: "aac", audio_bitrate: "128k"),
        preset!("1080p_h265_high", "1920x1080 H.265, high quality, strong compression", "libx265",
            resolution: "1920:1080", crf: 20, preset: "slow",
            audio_codec: "aac", audio_bitrate: "128k"),
        preset!("1080p_h265_standard", "1920x1080 H.265, space-saving default", "libx265",
            resolution: "1920:1080", crf: 28, preset: "medium",
            audio_codec: "aac", audio_bitrate: "128k"),
        preset!("4k_h265", "3840x2160 H.265, ultra high definition", "libx265",
            resolution: "3840:2160", crf: 24, preset: "medium",
            audio_codec: "aac", audio_bitrate: "128k"),
        preset!("1080p_nvenc", "1920x1080 NVIDIA hardware H.264 encode", "h264_nvenc",
            resolution: "1920:1080", bitrate: "8M", preset: "p4",
            audio_codec: "aac", audio_bitrate: "128k"),
        preset!("1080p_hevc_nvenc", "1920x1080 NVIDIA hardware HEVC encode", "hevc_nvenc",
            resolution: "1920:1080", bitrate: "5M", preset: "p4",
            audio_codec: "aac", audio_bitrate: "128k"),
        preset!("audio_mp3", "Extract audio and encode as MP3", "none",
            audio_codec: "libmp3lame", audio_bitrate: "320k"),
        preset!("audio_aac", "Extract audio and encode as AAC", "none",
            audio_codec: "aac", audio_bitrate: "256k"),
    ]
});

/// Look up a preset by id.
pub fn get_preset(id: &str) -> Option<&'static TranscodePreset> {
    PRESETS.iter().find(|preset| preset.id == id)
}

/// All preset ids in catalog order.
pub fn list_presets() -> Vec<&'static str> {
    PRESETS.iter().map(|preset| preset.id).collect()
}

/// `(id, description)` pairs in catalog order.
pub fn preset_descriptions() -> Vec<(&'static str, &'static str)> {
    PRESETS
        .iter()
        .map(|preset| (preset.id, preset.description))
        .collect()
}

/// Build a downscale-only `-vf` expression from maximum dimensions.
///
/// When both bounds are given, aspect ratio is preserved by
/// `force_original_aspect_ratio=decrease`; with a single bound the other
/// axis uses `-2` so ffmpeg keeps it even and proportional. Commas inside
/// `min()` must be escaped so the filter parser does not split on them.
pub fn build_scale_filter(max_width: Option<u32>, max_height: Option<u32>) -> Option<String> {
    match (max_width, max_height) {
        (Some(w), Some(h)) => Some(format!(
            "scale=w=min(iw\\,{w}):h=min(ih\\,{h}):force_original_aspect_ratio=decrease"
        )),
        (Some(w), None) => Some(format!("scale=w=min(iw\\,{w}):h=-2")),
        (None, Some(h)) => Some(format!("scale=w=-2:h=min(ih\\,{h})")),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_preset_uses_crf() {
        let args = get_preset("1080p_h265_standard").unwrap().to_ffmpeg_args();
        assert_eq!(
            args,
            vec![
                "-c:v",
                "libx265",
                "-vf",
                "scale=1920:1080",
                "-crf",
                "28",
                "-preset",
                "medium",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
            ]
        );
    }

    #[test]
    fn nvenc_preset_without_crf_uses_bitrate() {
        let args = get_preset("1080p_hevc_nvenc").unwrap().to_ffmpeg_args();
        assert!(args.contains(&"hevc_nvenc".to_string()));
        let bv = args.iter().position(|a| a == "-b:v").unwrap();
        assert_eq!(args[bv + 1], "5M");
        assert!(!args.contains(&"-crf".to_string()));
    }

    #[test]
    fn nvenc_crf_lowers_to_cq() {
        let preset = TranscodePreset {
            id: "test_nvenc_cq",
            description: "",
            codec: "h264_nvenc",
            resolution: None,
            crf: Some(23),
            bitrate: None,
            preset: None,
            audio_codec: None,
            audio_bitrate: None,
        };
        let args = preset.to_ffmpeg_args();
        assert_eq!(args, vec!["-c:v", "h264_nvenc", "-cq", "23"]);
    }

    #[test]
    fn audio_preset_drops_video_stream() {
        let args = get_preset("audio_mp3").unwrap().to_ffmpeg_args();
        assert_eq!(args[0], "-vn");
        assert!(args.contains(&"libmp3lame".to_string()));
        assert!(!args.contains(&"-c:v".to_string()));
    }

    #[test]
    fn unknown_preset_is_none_and_catalog_is_stable() {
        assert!(get_preset("does_not_exist").is_none());
        let ids = list_presets();
        assert_eq!(ids.first(), Some(&"1080p_h264_high"));
        assert!(ids.contains(&"audio_aac"));
        assert_eq!(ids.len(), preset_descriptions().len());
    }

    #[test]
    fn scale_filter_bounds_both_axes() {
        assert_eq!(
            build_scale_filter(Some(1920), Some(1080)).unwrap(),
            "scale=w=min(iw\\,1920):h=min(ih\\,1080):force_original_aspect_ratio=decrease"
        );
        assert_eq!(
            build_scale_filter(Some(1280), None).unwrap(),
            "scale=w=min(iw\\,1280):h=-2"
        );
        assert_eq!(
            build_scale_filter(None, Some(720)).unwrap(),
            "scale=w=-2:h=min(ih\\,720)"
        );
        assert_eq!(build_scale_filter(None, None), None);
    }
}
