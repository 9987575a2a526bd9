//! XML codec for `Variant`. The element scheme is typed so that documents
//! round-trip without schema knowledge:
//!
//! ```text
//! <null/> <bool>true</bool> <int>7</int> <float>0.5</float> <str>s</str>
//! <array> child* </array>
//! <object> <entry key="name"> child </entry> * </object>
//! ```

use super::{Variant, VariantError, VariantResult};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::collections::BTreeMap;

pub fn parse(text: &str) -> VariantResult<Variant> {
    // Whitespace-only text between elements is skipped explicitly below so
    // that string element content stays untrimmed.
    let mut reader = Reader::from_str(text);

    let value = parse_value(&mut reader)?;

    // Anything after the root element other than whitespace is malformed.
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Eof => return Ok(value),
            Event::Text(text) if text.unescape().map_err(xml_err)?.trim().is_empty() => continue,
            Event::Decl(_) | Event::Comment(_) => continue,
            other => {
                return Err(VariantError::Xml(format!(
                    "trailing content after document root: {:?}",
                    other
                )))
            }
        }
    }
}

pub fn render(variant: &Variant) -> String {
    let mut writer = Writer::new(Vec::new());
    write_value(&mut writer, variant);
    String::from_utf8(writer.into_inner()).expect("XML writer emits UTF-8")
}

fn xml_err<E: std::fmt::Display>(err: E) -> VariantError {
    VariantError::Xml(err.to_string())
}

/// Read the next value element off the reader.
fn parse_value(reader: &mut Reader<&[u8]>) -> VariantResult<Variant> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Decl(_) | Event::Comment(_) => continue,
            Event::Text(text) if text.unescape().map_err(xml_err)?.trim().is_empty() => continue,
            Event::Empty(start) => return parse_empty(&start),
            Event::Start(start) => return parse_element(reader, &start),
            Event::Eof => return Err(VariantError::Xml("unexpected end of document".to_string())),
            other => return Err(VariantError::Xml(format!("unexpected event {:?}", other))),
        }
    }
}

fn parse_empty(start: &BytesStart) -> VariantResult<Variant> {
    match start.name().as_ref() {
        b"null" => Ok(Variant::Null),
        b"str" => Ok(Variant::Str(String::new())),
        b"array" => Ok(Variant::Array(Vec::new())),
        b"object" => Ok(Variant::Object(BTreeMap::new())),
        name => Err(VariantError::Xml(format!(
            "empty element <{}/> has no value",
            String::from_utf8_lossy(name)
        ))),
    }
}

fn parse_element(reader: &mut Reader<&[u8]>, start: &BytesStart) -> VariantResult<Variant> {
    let name = start.name().as_ref().to_vec();

    match name.as_slice() {
        b"null" => {
            expect_end(reader, b"null")?;
            Ok(Variant::Null)
        }
        b"bool" => {
            let text = read_text(reader, b"bool")?;
            match text.as_str() {
                "true" => Ok(Variant::Bool(true)),
                "false" => Ok(Variant::Bool(false)),
                other => Err(VariantError::Xml(format!("invalid bool: {}", other))),
            }
        }
        b"int" => {
            let text = read_text(reader, b"int")?;
            text.parse::<i64>()
                .map(Variant::Int)
                .map_err(|err| VariantError::Xml(format!("invalid int {}: {}", text, err)))
        }
        b"float" => {
            let text = read_text(reader, b"float")?;
            text.parse::<f64>()
                .map(Variant::Float)
                .map_err(|err| VariantError::Xml(format!("invalid float {}: {}", text, err)))
        }
        b"str" => Ok(Variant::Str(read_text(reader, b"str")?)),
        b"array" => parse_array(reader),
        b"object" => parse_object(reader),
        name => Err(VariantError::Xml(format!(
            "unknown element <{}>",
            String::from_utf8_lossy(name)
        ))),
    }
}

fn parse_array(reader: &mut Reader<&[u8]>) -> VariantResult<Variant> {
    let mut items = Vec::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Text(text) if text.unescape().map_err(xml_err)?.trim().is_empty() => continue,
            Event::Comment(_) => continue,
            Event::End(end) if end.name().as_ref() == b"array" => return Ok(Variant::Array(items)),
            Event::Empty(start) => items.push(parse_empty(&start)?),
            Event::Start(start) => items.push(parse_element(reader, &start)?),
            other => return Err(VariantError::Xml(format!("unexpected event in array: {:?}", other))),
        }
    }
}

fn parse_object(reader: &mut Reader<&[u8]>) -> VariantResult<Variant> {
    let mut object = BTreeMap::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Text(text) if text.unescape().map_err(xml_err)?.trim().is_empty() => continue,
            Event::Comment(_) => continue,
            Event::End(end) if end.name().as_ref() == b"object" => {
                return Ok(Variant::Object(object))
            }
            Event::Start(start) if start.name().as_ref() == b"entry" => {
                let key = entry_key(&start)?;
                let value = parse_value(reader)?;
                expect_end(reader, b"entry")?;
                object.insert(key, value);
            }
            other => {
                return Err(VariantError::Xml(format!("unexpected event in object: {:?}", other)))
            }
        }
    }
}

fn entry_key(start: &BytesStart) -> VariantResult<String> {
    for attr in start.attributes() {
        let attr = attr.map_err(xml_err)?;
        if attr.key.as_ref() == b"key" {
            return Ok(attr.unescape_value().map_err(xml_err)?.into_owned());
        }
    }

    Err(VariantError::Xml("<entry> without key attribute".to_string()))
}

fn read_text(reader: &mut Reader<&[u8]>, element: &[u8]) -> VariantResult<String> {
    let mut content = String::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Text(text) => content.push_str(&text.unescape().map_err(xml_err)?),
            Event::End(end) if end.name().as_ref() == element => return Ok(content),
            other => return Err(VariantError::Xml(format!("unexpected event in text: {:?}", other))),
        }
    }
}

fn expect_end(reader: &mut Reader<&[u8]>, element: &[u8]) -> VariantResult<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Text(text) if text.unescape().map_err(xml_err)?.trim().is_empty() => continue,
            Event::End(end) if end.name().as_ref() == element => return Ok(()),
            other => {
                return Err(VariantError::Xml(format!(
                    "expected </{}>, got {:?}",
                    String::from_utf8_lossy(element),
                    other
                )))
            }
        }
    }
}

fn write_value(writer: &mut Writer<Vec<u8>>, variant: &Variant) {
    // Writing to a Vec cannot fail.
    match variant {
        Variant::Null => {
            writer.write_event(Event::Empty(BytesStart::new("null"))).unwrap();
        }
        Variant::Bool(value) => write_text(writer, "bool", if *value { "true" } else { "false" }),
        Variant::Int(value) => write_text(writer, "int", &value.to_string()),
        Variant::Float(value) => write_text(writer, "float", &value.to_string()),
        Variant::Str(value) => write_text(writer, "str", value),
        Variant::Array(items) => {
            writer.write_event(Event::Start(BytesStart::new("array"))).unwrap();
            for item in items {
                write_value(writer, item);
            }
            writer.write_event(Event::End(BytesEnd::new("array"))).unwrap();
        }
        Variant::Object(object) => {
            writer.write_event(Event::Start(BytesStart::new("object"))).unwrap();
            for (key, value) in object {
                let mut entry = BytesStart::new("entry");
                entry.push_attribute(("key", key.as_str()));
                writer.write_event(Event::Start(entry)).unwrap();
                write_value(writer, value);
                writer.write_event(Event::End(BytesEnd::new("entry"))).unwrap();
            }
            writer.write_event(Event::End(BytesEnd::new("object"))).unwrap();
        }
    }
}

fn write_text(writer: &mut Writer<Vec<u8>>, element: &str, text: &str) {
    writer.write_event(Event::Start(BytesStart::new(element))).unwrap();
    writer.write_event(Event::Text(BytesText::new(text))).unwrap();
    writer.write_event(Event::End(BytesEnd::new(element))).unwrap();
}
