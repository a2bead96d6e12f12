//! Internal module providing handy function

macro_rules! from_err {
    ($from:ty, $to:tt, $var:tt) => {
        impl From<$from> for $to {
            fn from(e: $from) -> $to {
                $to::$var(e)
            }
        }
    };
}

/// Parses an unsigned decimal number, rejecting signs and empty input
pub(crate) fn parse_u32(s: &[u8]) -> Option<u32> {
    if s.is_empty() || !s.iter().all(u8::is_ascii_digit) {
        return None;
    }
    atoi_simd::parse::<u32>(s).ok()
}

/// Returns a closure turning any displayable error into a [`MergeError::MalformedXml`]
/// naming `part`
///
/// [`MergeError::MalformedXml`]: crate::MergeError::MalformedXml
pub(crate) fn malformed<E: std::fmt::Display>(part: &str) -> impl Fn(E) -> crate::MergeError + '_ {
    move |e| crate::MergeError::MalformedXml {
        part: part.to_string(),
        message: e.to_string(),
    }
}
