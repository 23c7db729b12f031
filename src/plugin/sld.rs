//! Colour classes from a GeoServer SLD body.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    /// `#rrggbb` (the `#` is optional) with an opacity in `0..=1`.
    pub fn from_hex(hex: &str, opacity: f64) -> Option<Self> {
        let hex = hex.trim().trim_start_matches('#');
        if hex.len() < 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        Some(Self {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
            a: (opacity.clamp(0.0, 1.0) * 255.0) as u8,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorRampItem {
    pub value: f64,
    pub color: Rgba,
    pub label: String,
}

/// Exact-match classification: a pixel takes the colour of the item whose value it
/// equals. Items are sorted by value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColorRamp {
    pub items: Vec<ColorRampItem>,
}

impl ColorRamp {
    /// Collects every `ColorMapEntry` in `sld`.
    ///
    /// Entries with an unreadable colour or quantity are skipped. Returns `None` when
    /// no usable entry is left.
    pub fn from_sld(sld: &str) -> Option<Self> {
        let mut reader = Reader::from_str(sld);
        reader.config_mut().trim_text(true);
        reader.config_mut().check_end_names = false;

        let mut items = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Empty(e)) | Ok(Event::Start(e))
                    if e.local_name().as_ref() == b"ColorMapEntry" =>
                {
                    match parse_entry(&e) {
                        Some(item) => {
                            log::debug!(
                                target: "GEOFM",
                                "Added color entry: {} = {:?} for value {}",
                                item.label,
                                item.color,
                                item.value
                            );
                            items.push(item);
                        }
                        None => log::warn!(target: "GEOFM", "Error parsing color entry"),
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!(target: "GEOFM", "SLD parse stopped at {}: {}", reader.buffer_position(), e);
                    break;
                }
            }
        }

        if items.is_empty() {
            log::warn!(target: "GEOFM", "No ColorMapEntry found in SLD");
            return None;
        }
        items.sort_by(|a, b| a.value.total_cmp(&b.value));
        Some(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn parse_entry(e: &BytesStart<'_>) -> Option<ColorRampItem> {
    let mut color = None;
    let mut opacity = None;
    let mut quantity = None;
    let mut label = None;
    for attr in e.attributes().with_checks(false).flatten() {
        let value = attr.unescape_value().ok()?.into_owned();
        match attr.key.local_name().as_ref() {
            b"color" => color = Some(value),
            b"opacity" => opacity = Some(value),
            b"quantity" => quantity = Some(value),
            b"label" => label = Some(value),
            _ => {}
        }
    }

    let quantity = quantity?;
    let value: f64 = quantity.trim().parse().ok()?;
    let opacity: f64 = match opacity {
        Some(o) => o.trim().parse().ok()?,
        None => 1.0,
    };
    let color = Rgba::from_hex(&color?, opacity)?;
    let label = label
        .map(|l| l.trim().to_string())
        .unwrap_or_else(|| quantity.trim().to_string());
    Some(ColorRampItem { value, color, label })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLD: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<StyledLayerDescriptor xmlns="http://www.opengis.net/sld" version="1.0.0">
  <NamedLayer><UserStyle><FeatureTypeStyle><Rule><RasterSymbolizer>
    <ColorMap type="values">
      <ColorMapEntry color="#0000ff" opacity="1.0" quantity="1" label="Flood"/>
      <ColorMapEntry color="#000000" opacity="0" quantity="0" label=" No flood "/>
    </ColorMap>
  </RasterSymbolizer></Rule></FeatureTypeStyle></UserStyle></NamedLayer>
</StyledLayerDescriptor>"##;

    #[test]
    fn entries_are_sorted_by_quantity() {
        let ramp = ColorRamp::from_sld(SLD).unwrap();
        assert_eq!(ramp.len(), 2);
        assert_eq!(ramp.items[0].value, 0.0);
        assert_eq!(ramp.items[0].label, "No flood");
        assert_eq!(ramp.items[0].color.a, 0);
        assert_eq!(ramp.items[1].value, 1.0);
        assert_eq!(ramp.items[1].color, Rgba { r: 0, g: 0, b: 255, a: 255 });
    }

    #[test]
    fn missing_opacity_and_label_default() {
        let ramp = ColorRamp::from_sld(r##"<ColorMap><ColorMapEntry color="#ff8000" quantity="3"/></ColorMap>"##)
            .unwrap();
        assert_eq!(ramp.items[0].color, Rgba { r: 255, g: 128, b: 0, a: 255 });
        assert_eq!(ramp.items[0].label, "3");
    }

    #[test]
    fn bad_entries_are_skipped() {
        let sld = r##"<ColorMap>
            <ColorMapEntry color="zz" quantity="1"/>
            <ColorMapEntry color="#00ff00" quantity="two"/>
            <ColorMapEntry color="#00ff00" quantity="2"/>
        </ColorMap>"##;
        let ramp = ColorRamp::from_sld(sld).unwrap();
        assert_eq!(ramp.len(), 1);
        assert_eq!(ramp.items[0].value, 2.0);
    }

    #[test]
    fn no_entries_is_none() {
        assert!(ColorRamp::from_sld("<ColorMap/>").is_none());
        assert!(ColorRamp::from_sld("").is_none());
    }
}
