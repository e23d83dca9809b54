use serde::Serialize;

/// Stream classes carried in the `STREAM_TYPE` property.
///
/// `File` acts as a bridge type during chain resolution (demuxing and
/// muxing may cross it freely); `Encrypted` inherits the concrete type of
/// the other side of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum StreamType {
    Unknown = 0,
    File = 1,
    Audio = 2,
    Visual = 3,
    Text = 4,
    Scene = 5,
    Metadata = 6,
    Encrypted = 7,
}

impl StreamType {
    pub fn from_u32(v: u32) -> StreamType {
        match v {
            1 => StreamType::File,
            2 => StreamType::Audio,
            3 => StreamType::Visual,
            4 => StreamType::Text,
            5 => StreamType::Scene,
            6 => StreamType::Metadata,
            7 => StreamType::Encrypted,
            _ => StreamType::Unknown,
        }
    }

    pub fn from_name(name: &str) -> Option<StreamType> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "file" => Some(StreamType::File),
            "audio" => Some(StreamType::Audio),
            "video" | "visual" => Some(StreamType::Visual),
            "text" => Some(StreamType::Text),
            "scene" => Some(StreamType::Scene),
            "metadata" => Some(StreamType::Metadata),
            "encrypted" => Some(StreamType::Encrypted),
            _ => None,
        }
    }
}

/// Value types a property may take; drives typed parsing of filter args.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropType {
    Sint,
    Uint,
    LongSint,
    LongUint,
    Bool,
    Fraction,
    Float,
    Double,
    String,
    Data,
    StringList,
    UintList,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PropValue {
    Sint(i32),
    Uint(u32),
    LongSint(i64),
    LongUint(u64),
    Bool(bool),
    Fraction { num: i32, den: u32 },
    Float(f32),
    Double(f64),
    String(String),
    Data(Vec<u8>),
    StringList(Vec<String>),
    UintList(Vec<u32>),
}

impl PropValue {
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            PropValue::Uint(v) => Some(*v),
            PropValue::Sint(v) if *v >= 0 => Some(*v as u32),
            PropValue::LongUint(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        self.as_uint().map(StreamType::from_u32)
    }

    /// Parses `text` as a value of the given type. List values use
    /// `sep_list` between items.
    pub fn parse(ptype: PropType, text: &str, sep_list: char) -> Option<PropValue> {
        let v = match ptype {
            PropType::Sint => PropValue::Sint(text.parse().ok()?),
            PropType::Uint => PropValue::Uint(text.parse().ok()?),
            PropType::LongSint => PropValue::LongSint(text.parse().ok()?),
            PropType::LongUint => PropValue::LongUint(text.parse().ok()?),
            PropType::Bool => match text {
                "yes" | "true" | "1" => PropValue::Bool(true),
                "no" | "false" | "0" => PropValue::Bool(false),
                _ => return None,
            },
            PropType::Fraction => {
                let (n, d) = match text.split_once('/') {
                    Some((n, d)) => (n.parse().ok()?, d.parse().ok()?),
                    None => (text.parse().ok()?, 1),
                };
                PropValue::Fraction { num: n, den: d }
            }
            PropType::Float => PropValue::Float(text.parse().ok()?),
            PropType::Double => PropValue::Double(text.parse().ok()?),
            PropType::String => PropValue::String(text.to_string()),
            PropType::Data => PropValue::Data(text.as_bytes().to_vec()),
            PropType::StringList => {
                PropValue::StringList(text.split(sep_list).map(str::to_string).collect())
            }
            PropType::UintList => {
                let mut vals = Vec::new();
                for item in text.split(sep_list) {
                    vals.push(item.parse().ok()?);
                }
                PropValue::UintList(vals)
            }
        };
        Some(v)
    }

    /// Printable form used by the filename template resolver.
    pub fn dump(&self) -> String {
        match self {
            PropValue::Sint(v) => v.to_string(),
            PropValue::Uint(v) => v.to_string(),
            PropValue::LongSint(v) => v.to_string(),
            PropValue::LongUint(v) => v.to_string(),
            PropValue::Bool(v) => v.to_string(),
            PropValue::Fraction { num, den } => format!("{}/{}", num, den),
            PropValue::Float(v) => v.to_string(),
            PropValue::Double(v) => v.to_string(),
            PropValue::String(s) => s.clone(),
            PropValue::Data(d) => format!("data[{}]", d.len()),
            PropValue::StringList(l) => l.join(","),
            PropValue::UintList(l) => l
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_typed_values() {
        assert_eq!(
            PropValue::parse(PropType::Uint, "44100", ','),
            Some(PropValue::Uint(44100))
        );
        assert_eq!(
            PropValue::parse(PropType::Fraction, "30000/1001", ','),
            Some(PropValue::Fraction { num: 30000, den: 1001 })
        );
        assert_eq!(
            PropValue::parse(PropType::Bool, "yes", ','),
            Some(PropValue::Bool(true))
        );
        assert_eq!(
            PropValue::parse(PropType::UintList, "1,2,3", ','),
            Some(PropValue::UintList(vec![1, 2, 3]))
        );
        assert_eq!(PropValue::parse(PropType::Uint, "abc", ','), None);
    }

    #[test]
    fn stream_type_names() {
        assert_eq!(StreamType::from_name("video"), Some(StreamType::Visual));
        assert_eq!(StreamType::from_name("AUDIO"), Some(StreamType::Audio));
        assert_eq!(StreamType::from_name("bogus"), None);
        assert_eq!(StreamType::from_u32(1), StreamType::File);
    }
}
