//! Just enough of an xml tree to read replies. Names are local names,
//! namespace prefixes and `xmlns` bindings are dropped.
use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};

use crate::error::{NetconfError, NetconfResult};

pub use quick_xml::escape::escape;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

fn xml_err(err: impl std::fmt::Display) -> NetconfError {
    NetconfError::Xml(err.to_string())
}

impl Element {
    pub fn parse(s: &str) -> NetconfResult<Element> {
        let mut reader = Reader::from_str(s);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root = None;
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(start) => stack.push(Element::from_start(&start)?),
                Event::Empty(start) => {
                    let el = Element::from_start(&start)?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::Text(text) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text.unescape().map_err(xml_err)?);
                    }
                }
                Event::CData(data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::End(_) => {
                    let el = stack
                        .pop()
                        .ok_or_else(|| NetconfError::Xml("unbalanced end tag".into()))?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }
        if !stack.is_empty() {
            return Err(NetconfError::Xml("unclosed element".into()));
        }
        root.ok_or_else(|| NetconfError::Xml("empty document".into()))
    }

    fn from_start(start: &BytesStart<'_>) -> NetconfResult<Element> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(xml_err)?;
            if attr.key.as_namespace_binding().is_some() {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_err)?.into_owned();
            attrs.push((key, value));
        }
        Ok(Element {
            name,
            attrs,
            ..Default::default()
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// first direct child named `name`
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(Element::text)
    }

    /// every element below this one named `name`, depth first
    pub fn descendants(&self, name: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        self.collect(name, &mut found);
        found
    }

    fn collect<'a>(&'a self, name: &str, found: &mut Vec<&'a Element>) {
        for c in &self.children {
            if c.name == name {
                found.push(c);
            }
            c.collect(name, found);
        }
    }

    /// first element below this one named `name`
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children
            .iter()
            .find_map(|c| if c.name == name { Some(c) } else { c.find(name) })
    }
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    el: Element,
) -> NetconfResult<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(el),
        None if root.is_none() => *root = Some(el),
        None => return Err(NetconfError::Xml("more than one root element".into())),
    }
    Ok(())
}

/// Reads an attribute off the root element without parsing the rest of the
/// document. Used by the receive loop to route a frame.
pub fn root_attr(doc: &str, name: &str) -> Option<String> {
    let mut reader = Reader::from_str(doc);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event().ok()? {
            Event::Start(start) | Event::Empty(start) => {
                return start
                    .attributes()
                    .flatten()
                    .find(|a| a.key.local_name().as_ref() == name.as_bytes())
                    .and_then(|a| a.unescape_value().ok())
                    .map(|v| v.into_owned());
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}
