//! Filename template resolution for file sink filters.
//!
//! Recognizes `$KEYWORD[%fmt]$` blocks where KEYWORD is `num`, `URL`,
//! `File`, `PID`, `DS`, `p4cc=ABCD`, `pname=<name>`, or the 4CC/name of
//! a pid property. `$$` is a single-character escape producing `$`.
//! The DASH keywords `Number`, `Time`, `RepresentationID`, `Bandwidth`
//! and `SubNumber` are preserved verbatim for downstream muxers.

use crate::error::{Error, Result};
use crate::pid::Pid;
use crate::props::{prop_code_by_name, PropValue, PID_FILEPATH, PID_ID, PID_URL};
use crate::util::fourcc_from_str;

const PASSTHROUGH: &[&str] = &[
    "Number",
    "Time",
    "RepresentationID",
    "Bandwidth",
    "SubNumber",
];

/// Applies a printf-style integer format (`%[0][width][d|x|X]`).
fn format_int(fmt: &str, value: i64) -> String {
    let spec = fmt.trim_start_matches('%');
    let (body, base) = match spec.chars().last() {
        Some('x') => (&spec[..spec.len() - 1], 16),
        Some('X') => (&spec[..spec.len() - 1], 17),
        Some('d') | Some('u') => (&spec[..spec.len() - 1], 10),
        _ => (spec, 10),
    };
    let zero_pad = body.starts_with('0');
    let width: usize = body.trim_start_matches('0').parse().unwrap_or(0);
    let digits = match base {
        16 => format!("{:x}", value),
        17 => format!("{:X}", value),
        _ => format!("{}", value),
    };
    if digits.len() >= width {
        return digits;
    }
    let pad = if zero_pad { '0' } else { ' ' };
    let mut out = String::new();
    for _ in 0..(width - digits.len()) {
        out.push(pad);
    }
    out.push_str(&digits);
    out
}

/// Strips directory and extension from a path value.
fn file_basename(path: &str) -> String {
    let name = path
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(path);
    match name.rfind('.') {
        Some(pos) => name[..pos].to_string(),
        None => name.to_string(),
    }
}

/// Resolves `template` against the pid's properties.
pub fn resolve_file_template(
    pid: &Pid,
    template: &str,
    file_idx: u32,
    file_suffix: Option<&str>,
) -> Result<String> {
    if !template.contains('$') {
        return Ok(template.to_string());
    }
    let mut out = String::new();
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        if chars.get(i + 1) == Some(&'$') {
            out.push('$');
            i += 2;
            continue;
        }
        let end = match chars[i + 1..].iter().position(|&c| c == '$') {
            Some(p) => i + 1 + p,
            None => {
                log::warn!("broken template {}, expecting $KEYWORD$", template);
                return Err(Error::BadParam);
            }
        };
        let body: String = chars[i + 1..end].iter().collect();
        let (name, fmt) = match body.find('%') {
            Some(p) => (&body[..p], Some(&body[p..])),
            None => (body.as_str(), None),
        };

        if PASSTHROUGH.iter().any(|k| name.starts_with(k)) {
            out.push('$');
            out.push_str(&body);
            out.push('$');
            i = end + 1;
            continue;
        }

        let mut int_val: Option<i64> = None;
        let mut str_val: Option<String> = None;
        let mut is_file_str = false;

        if name == "num" {
            int_val = Some(file_idx as i64);
        } else if name == "URL" {
            str_val = pid.get_property(PID_URL).map(|v| v.dump());
            is_file_str = true;
        } else if name == "File" {
            str_val = pid
                .get_property(PID_FILEPATH)
                .or_else(|| pid.get_property(PID_URL))
                .map(|v| v.dump());
            is_file_str = true;
        } else if name == "PID" {
            match pid.get_property(PID_ID) {
                Some(PropValue::Uint(v)) => int_val = Some(v as i64),
                Some(v) => str_val = Some(v.dump()),
                None => {}
            }
        } else if name == "DS" {
            str_val = Some(file_suffix.unwrap_or("").to_string());
        } else if let Some(code_str) = name.strip_prefix("p4cc=") {
            let code = fourcc_from_str(code_str).ok_or(Error::BadParam)?;
            match pid.get_property(code) {
                Some(PropValue::Uint(v)) => int_val = Some(v as i64),
                Some(PropValue::Sint(v)) => int_val = Some(v as i64),
                Some(v) => str_val = Some(v.dump()),
                None => {
                    log::warn!("no pid property of type {}", code_str);
                    return Err(Error::BadParam);
                }
            }
        } else if let Some(pname) = name.strip_prefix("pname=") {
            match pid.get_property_str(pname) {
                Some(v) => str_val = Some(v.dump()),
                None => {
                    log::warn!("no pid property named {}", pname);
                    return Err(Error::BadParam);
                }
            }
        } else {
            // a bare property 4CC or descriptive name
            let prop = fourcc_from_str(name)
                .and_then(|c| pid.get_property(c))
                .or_else(|| prop_code_by_name(name).and_then(|c| pid.get_property(c)))
                .or_else(|| pid.get_property_str(name));
            match prop {
                Some(PropValue::Uint(v)) => int_val = Some(v as i64),
                Some(PropValue::Sint(v)) => int_val = Some(v as i64),
                Some(v) => str_val = Some(v.dump()),
                None => {
                    log::warn!("property {} not found for pid, cannot resolve template", name);
                    return Err(Error::BadParam);
                }
            }
        }

        if let Some(v) = int_val {
            out.push_str(&format_int(fmt.unwrap_or("%d"), v));
        } else if let Some(s) = str_val {
            if is_file_str {
                out.push_str(&file_basename(&s));
            } else {
                out.push_str(&s);
            }
        }
        i = end + 1;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::PropValue;
    use crate::registry::FilterRegister;
    use crate::session::Session;

    fn test_pid() -> std::sync::Arc<Pid> {
        let session = Session::new();
        let reg = FilterRegister::builder("src").process(|_| Ok(())).build();
        let filter = session.load_filter(&reg);
        let pid = filter.new_output_pid();
        pid.set_property(PID_ID, PropValue::Uint(3)).unwrap();
        pid.set_property(PID_URL, PropValue::String("/media/in/movie.mp4".into()))
            .unwrap();
        pid
    }

    #[test]
    fn number_with_format() {
        let pid = test_pid();
        assert_eq!(
            resolve_file_template(&pid, "seg_$num%04d$.m4s", 7, None).unwrap(),
            "seg_0007.m4s"
        );
    }

    #[test]
    fn url_strips_dir_and_ext() {
        let pid = test_pid();
        assert_eq!(
            resolve_file_template(&pid, "$URL$_out", 0, None).unwrap(),
            "movie_out"
        );
    }

    #[test]
    fn dollar_escape() {
        let pid = test_pid();
        assert_eq!(
            resolve_file_template(&pid, "cost_$$5_$num$", 2, None).unwrap(),
            "cost_$5_2"
        );
    }

    #[test]
    fn dash_keywords_kept() {
        let pid = test_pid();
        assert_eq!(
            resolve_file_template(&pid, "r_$RepresentationID$_$Number%05d$", 1, None).unwrap(),
            "r_$RepresentationID$_$Number%05d$"
        );
    }

    #[test]
    fn unknown_property_fails() {
        let pid = test_pid();
        assert!(resolve_file_template(&pid, "$NoSuchThing$", 0, None).is_err());
    }

    #[test]
    fn suffix_and_pid_id() {
        let pid = test_pid();
        assert_eq!(
            resolve_file_template(&pid, "$PID$_$DS$", 0, Some("trackA")).unwrap(),
            "3_trackA"
        );
    }
}
