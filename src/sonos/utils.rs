//! Shared utility functions for SOAP/XML plumbing and URL construction.

use std::collections::HashMap;

use quick_xml::events::BytesStart;

use crate::stream::AudioCodec;

/// Builds a Sonos control/event URL from an IP and a path.
#[must_use]
pub fn build_sonos_url(ip: &str, path: &str) -> String {
    format!("http://{ip}:1400{path}")
}

/// Builds the URI a Sonos speaker should use to fetch a stream, appending
/// the scheme/extension the speaker expects for a given codec.
///
/// Sonos infers the container from the URL's extension, so PCM is served as
/// `.wav` and compressed codecs keep their native extension.
#[must_use]
pub fn build_sonos_stream_uri(uri: &str, codec: AudioCodec) -> String {
    let ext = match codec {
        AudioCodec::Pcm => "wav",
        AudioCodec::Flac => "flac",
        AudioCodec::Aac => "aac",
        AudioCodec::Mp3 => "mp3",
    };
    if uri.contains('?') {
        format!("{uri}&ext=.{ext}")
    } else {
        format!("{uri}?ext=.{ext}")
    }
}

/// Escapes the five XML predefined entities in a string.
#[must_use]
pub fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Extracts the IP address from an SSDP/device-description `LOCATION` URL,
/// e.g. `http://192.168.1.50:1400/xml/device_description.xml` -> `192.168.1.50`.
#[must_use]
pub fn extract_ip_from_location(location: &str) -> Option<String> {
    let without_scheme = location.split("://").nth(1)?;
    let host_port = without_scheme.split('/').next()?;
    let ip = host_port.split(':').next()?;
    if ip.is_empty() {
        None
    } else {
        Some(ip.to_string())
    }
}

/// Best-effort model name extracted from a device icon path, e.g.
/// `/img/icon-HT.png` -> `HT`. Returns `"unknown"` when no model segment is
/// recognized.
#[must_use]
pub fn extract_model_from_icon(icon: &str) -> String {
    icon.rsplit('/')
        .next()
        .and_then(|file| file.strip_prefix("icon-"))
        .and_then(|rest| rest.split('.').next())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Resolves a speaker's home-theater channel role (e.g. "Left", "Right",
/// "Sub") from a `HTSatChanMapSet` attribute value given its UUID.
///
/// The attribute is a semicolon-separated list of `UUID:ROLE` pairs, e.g.
/// `RINCON_A:LF,RF;RINCON_B:SW`.
#[must_use]
pub fn get_channel_role(ht_sat_chan_map: &str, uuid: &str) -> Option<String> {
    ht_sat_chan_map.split(';').find_map(|entry| {
        let (entry_uuid, roles) = entry.split_once(':')?;
        if entry_uuid != uuid {
            return None;
        }
        match roles {
            "LF,RF" => Some("Left+Right".to_string()),
            "LF" => Some("Left".to_string()),
            "RF" => Some("Right".to_string()),
            "SW" => Some("Sub".to_string()),
            other => Some(other.to_string()),
        }
    })
}

/// Reads a single XML attribute value from a `quick_xml` start/empty tag.
#[must_use]
pub fn get_xml_attr(tag: &BytesStart, name: &[u8]) -> Option<String> {
    tag.attributes().filter_map(Result::ok).find_map(|attr| {
        if attr.key.as_ref() == name {
            attr.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Extracts the text content of the first `<tag>...</tag>` occurrence in an
/// XML document, without building a full DOM.
///
/// Used for both SOAP response bodies and GENA `LastChange`/property-set
/// payloads, where only a handful of top-level fields are needed.
#[must_use]
pub fn extract_xml_text(xml: &str, tag: &str) -> Option<String> {
    let open_variants = [format!("<{tag}>"), format!("<{tag} ")];
    let start_tag = open_variants
        .iter()
        .find_map(|prefix| xml.find(prefix.as_str()).map(|idx| (idx, prefix.len())))?;
    let (open_idx, _) = start_tag;
    let content_start = xml[open_idx..].find('>')? + open_idx + 1;
    let close_tag = format!("</{tag}>");
    let close_idx = xml[content_start..].find(close_tag.as_str())? + content_start;
    Some(xml[content_start..close_idx].to_string())
}

/// Extracts `val` attributes from self-closing GENA `LastChange` elements
/// for the given element names, e.g. `<TransportState val="PLAYING"/>`.
#[must_use]
pub fn extract_empty_val_attrs(xml: &str, names: &[&str]) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for &name in names {
        let prefix = format!("<{name} ");
        if let Some(start) = xml.find(prefix.as_str()) {
            let tag_end = match xml[start..].find("/>").or_else(|| xml[start..].find('>')) {
                Some(i) => start + i,
                None => continue,
            };
            let tag_src = &xml[start..tag_end];
            if let Some(val) = extract_attr_from_tag_src(tag_src, "val") {
                result.insert(name.to_string(), val);
            }
        }
    }
    result
}

/// Extracts `val` attributes from GENA `LastChange` elements for the given
/// element names, restricted to `channel="Master"` occurrences (ignoring
/// per-channel LF/RF entries emitted for stereo pairs).
#[must_use]
pub fn extract_master_channel_attrs(xml: &str, names: &[&str]) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for &name in names {
        let prefix = format!("<{name} ");
        let mut search_from = 0;
        while let Some(rel_start) = xml[search_from..].find(prefix.as_str()) {
            let start = search_from + rel_start;
            let tag_end = match xml[start..].find("/>").or_else(|| xml[start..].find('>')) {
                Some(i) => start + i,
                None => break,
            };
            let tag_src = &xml[start..tag_end];
            if extract_attr_from_tag_src(tag_src, "channel").as_deref() == Some("Master") {
                if let Some(val) = extract_attr_from_tag_src(tag_src, "val") {
                    result.insert(name.to_string(), val);
                }
                break;
            }
            search_from = tag_end + 1;
        }
    }
    result
}

fn extract_attr_from_tag_src(tag_src: &str, attr: &str) -> Option<String> {
    let prefix = format!("{attr}=\"");
    let start = tag_src.find(prefix.as_str())? + prefix.len();
    let end = tag_src[start..].find('"')? + start;
    Some(tag_src[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_sonos_url_formats_port_1400() {
        assert_eq!(
            build_sonos_url("192.168.1.10", "/MediaRenderer/AVTransport/Control"),
            "http://192.168.1.10:1400/MediaRenderer/AVTransport/Control"
        );
    }

    #[test]
    fn build_sonos_stream_uri_appends_extension_by_codec() {
        assert!(build_sonos_stream_uri("http://host/s/abc", AudioCodec::Pcm).ends_with("ext=.wav"));
        assert!(build_sonos_stream_uri("http://host/s/abc", AudioCodec::Flac).ends_with("ext=.flac"));
        assert!(build_sonos_stream_uri("http://host/s/abc?x=1", AudioCodec::Aac).ends_with("&ext=.aac"));
    }

    #[test]
    fn escape_xml_escapes_predefined_entities() {
        assert_eq!(escape_xml("a & b <c> \"d\" 'e'"), "a &amp; b &lt;c&gt; &quot;d&quot; &apos;e&apos;");
    }

    #[test]
    fn extract_ip_from_location_parses_url() {
        assert_eq!(
            extract_ip_from_location("http://192.168.1.50:1400/xml/device_description.xml"),
            Some("192.168.1.50".to_string())
        );
    }

    #[test]
    fn extract_ip_from_location_rejects_malformed() {
        assert_eq!(extract_ip_from_location("not-a-url"), None);
    }

    #[test]
    fn extract_model_from_icon_parses_known_shape() {
        assert_eq!(extract_model_from_icon("/img/icon-HT.png"), "HT");
        assert_eq!(extract_model_from_icon("/img/other.png"), "unknown");
    }

    #[test]
    fn get_channel_role_finds_matching_uuid() {
        let map = "RINCON_A:LF,RF;RINCON_B:SW";
        assert_eq!(get_channel_role(map, "RINCON_A"), Some("Left+Right".to_string()));
        assert_eq!(get_channel_role(map, "RINCON_B"), Some("Sub".to_string()));
        assert_eq!(get_channel_role(map, "RINCON_C"), None);
    }

    #[test]
    fn extract_xml_text_finds_tag_with_and_without_attrs() {
        assert_eq!(
            extract_xml_text("<a>hello</a>", "a"),
            Some("hello".to_string())
        );
        assert_eq!(
            extract_xml_text("<a foo=\"1\">hello</a>", "a"),
            Some("hello".to_string())
        );
        assert_eq!(extract_xml_text("<b>x</b>", "a"), None);
    }

    #[test]
    fn extract_empty_val_attrs_reads_self_closing_tags() {
        let xml = r#"<TransportState val="PLAYING"/><CurrentTrackURI val="http://x"/>"#;
        let attrs = extract_empty_val_attrs(xml, &["TransportState", "CurrentTrackURI"]);
        assert_eq!(attrs.get("TransportState"), Some(&"PLAYING".to_string()));
        assert_eq!(attrs.get("CurrentTrackURI"), Some(&"http://x".to_string()));
    }

    #[test]
    fn extract_master_channel_attrs_ignores_lf_rf_channels() {
        let xml = r#"<Volume channel="LF" val="10"/><Volume channel="Master" val="42"/><Mute channel="Master" val="0"/>"#;
        let attrs = extract_master_channel_attrs(xml, &["Volume", "Mute"]);
        assert_eq!(attrs.get("Volume"), Some(&"42".to_string()));
        assert_eq!(attrs.get("Mute"), Some(&"0".to_string()));
    }
}
