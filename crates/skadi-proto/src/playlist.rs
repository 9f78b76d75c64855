//! HLS master playlist parsing.
//!
//! The remote platform answers the manifest request with a master playlist
//! where every rendition is announced by an `#EXT-X-MEDIA` tag and followed by
//! an `#EXT-X-STREAM-INF` tag plus the variant URI:
//!
//! ```text
//! #EXTM3U
//! #EXT-X-MEDIA:TYPE=VIDEO,GROUP-ID="chunked",NAME="1080p60 (source)",AUTOSELECT=YES,DEFAULT=YES
//! #EXT-X-STREAM-INF:BANDWIDTH=6000000,RESOLUTION=1920x1080,VIDEO="chunked"
//! https://video.example/chunked/index.m3u8
//! ```

use crate::channel::StreamQuality;

/// Group id the platform uses for the untranscoded source rendition.
const SOURCE_GROUP: &str = "chunked";

/// Parse a master playlist into the qualities a player can be asked for.
///
/// The result is ordered `[best, variants..., worst]`.  A body that is not a
/// playlist, or a playlist announcing no renditions, is an error.
pub fn parse_variant_playlist(content: &str) -> anyhow::Result<Vec<StreamQuality>> {
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some(first) if first.starts_with("#EXTM3U") => {}
        _ => anyhow::bail!("missing #EXTM3U header"),
    }

    // (group id, quality) in announcement order
    let mut variants: Vec<(String, StreamQuality)> = Vec::new();
    let mut pending_uri: Option<usize> = None;

    for line in lines {
        if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA:") {
            let attrs = parse_attributes(rest);
            let group = attribute(&attrs, "GROUP-ID");
            let name = attribute(&attrs, "NAME");
            if let (Some(group), Some(name)) = (group, name) {
                let quality = if group == SOURCE_GROUP {
                    "source".to_string()
                } else {
                    group.to_string()
                };
                variants.push((group.to_string(), StreamQuality::new(name, quality)));
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let attrs = parse_attributes(rest);
            pending_uri = match attribute(&attrs, "VIDEO") {
                Some(video) => variants.iter().position(|(group, _)| group == video),
                None if variants.is_empty() => None,
                None => Some(variants.len() - 1),
            };
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        if let Some(idx) = pending_uri.take() {
            variants[idx].1.uri = Some(line.to_string());
        }
    }

    if variants.is_empty() {
        anyhow::bail!("playlist announces no renditions");
    }

    let mut qualities = Vec::with_capacity(variants.len() + 2);
    qualities.push(StreamQuality::best());
    qualities.extend(variants.into_iter().map(|(_, q)| q));
    qualities.push(StreamQuality::worst());
    Ok(qualities)
}

/// Split an attribute list (`KEY=VALUE,KEY="quoted,value"`) into pairs.
fn parse_attributes(list: &str) -> Vec<(&str, &str)> {
    let mut attrs = Vec::new();
    let mut rest = list;

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];

        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };

        attrs.push((key, value));
        rest = remainder.trim_start_matches(',');
    }

    attrs
}

fn attribute<'a>(attrs: &[(&str, &'a str)], key: &str) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}
