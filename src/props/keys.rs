use crate::props::PropType;
use crate::util::{fourcc, FourCC};

pub const PID_ID: FourCC = fourcc(b"PIID");
pub const PID_ESID: FourCC = fourcc(b"ESID");
pub const PID_STREAM_TYPE: FourCC = fourcc(b"STTY");
pub const PID_CODEC_ID: FourCC = fourcc(b"CODC");
pub const PID_TIMESCALE: FourCC = fourcc(b"TIMS");
pub const PID_DURATION: FourCC = fourcc(b"PDUR");
pub const PID_DEPENDENCY_ID: FourCC = fourcc(b"DPID");
pub const PID_MIME: FourCC = fourcc(b"MIME");
pub const PID_FILE_EXT: FourCC = fourcc(b"FEXT");
pub const PID_URL: FourCC = fourcc(b"PURL");
pub const PID_FILEPATH: FourCC = fourcc(b"FPAT");
pub const PID_WIDTH: FourCC = fourcc(b"WIDT");
pub const PID_HEIGHT: FourCC = fourcc(b"HEIG");
pub const PID_BITRATE: FourCC = fourcc(b"RATE");
pub const PID_SAMPLE_RATE: FourCC = fourcc(b"SRAT");
pub const PID_NUM_CHANNELS: FourCC = fourcc(b"NCHA");

/// Codec id value meaning "uncompressed media".
pub const CODEC_RAW: u32 = 1;

const KNOWN: &[(FourCC, &str, PropType)] = &[
    (PID_ID, "ID", PropType::Uint),
    (PID_ESID, "ESID", PropType::Uint),
    (PID_STREAM_TYPE, "StreamType", PropType::Uint),
    (PID_CODEC_ID, "CodecID", PropType::Uint),
    (PID_TIMESCALE, "Timescale", PropType::Uint),
    (PID_DURATION, "Duration", PropType::Fraction),
    (PID_DEPENDENCY_ID, "DependencyID", PropType::Uint),
    (PID_MIME, "MIMEType", PropType::String),
    (PID_FILE_EXT, "Extension", PropType::String),
    (PID_URL, "URL", PropType::String),
    (PID_FILEPATH, "SourcePath", PropType::String),
    (PID_WIDTH, "Width", PropType::Uint),
    (PID_HEIGHT, "Height", PropType::Uint),
    (PID_BITRATE, "Bitrate", PropType::Uint),
    (PID_SAMPLE_RATE, "SampleRate", PropType::Uint),
    (PID_NUM_CHANNELS, "Channels", PropType::Uint),
];

/// Declared value type of a built-in property code.
pub fn prop_type_of(code: FourCC) -> Option<PropType> {
    KNOWN.iter().find(|(c, _, _)| *c == code).map(|(_, _, t)| *t)
}

pub fn prop_name_of(code: FourCC) -> Option<&'static str> {
    KNOWN.iter().find(|(c, _, _)| *c == code).map(|(_, n, _)| *n)
}

/// Looks a built-in property up by its descriptive name.
pub fn prop_code_by_name(name: &str) -> Option<FourCC> {
    KNOWN.iter().find(|(_, n, _)| *n == name).map(|(c, _, _)| *c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_and_code() {
        assert_eq!(prop_code_by_name("StreamType"), Some(PID_STREAM_TYPE));
        assert_eq!(prop_type_of(PID_MIME), Some(PropType::String));
        assert_eq!(prop_name_of(PID_ID), Some("ID"));
        assert_eq!(prop_code_by_name("NoSuchProp"), None);
    }
}
