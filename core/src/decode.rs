use crate::error::DecodeError;
use crate::model::{
    Configuration, Endpoint, EvidenceNode, Fingerprint, HostName, ListItem, ScanRun, Service, Test,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt;
use tracing::{debug, trace};

/// Deepest `Paragraph` nesting accepted before the input is rejected.
pub const MAX_EVIDENCE_DEPTH: usize = 256;

/// Decodes one scan report into a [`ScanRun`].
///
/// The root element's own name is not checked; its attributes and children
/// are matched by local name. Missing attributes and elements decode to empty
/// strings and empty sequences. All values are returned as text.
pub fn decode(xml: &[u8]) -> Result<ScanRun, DecodeError> {
    debug!(bytes = xml.len(), "decoding scan report");
    let run = Decoder::new(xml).root()?;
    debug!(
        address = %run.address,
        host_names = run.host_names.len(),
        fingerprints = run.fingerprints.len(),
        tests = run.tests.len(),
        endpoints = run.endpoints.len(),
        "decoded scan report"
    );
    Ok(run)
}

fn is_xml_char(ch: char) -> bool {
    matches!(
        ch,
        '\u{9}' | '\u{A}' | '\u{D}' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..
    )
}

struct Element<'a> {
    start: BytesStart<'a>,
    empty: bool,
}

impl Element<'_> {
    fn local_name(&self) -> &[u8] {
        self.start.local_name().into_inner()
    }
}

struct Decoder<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Decoder<'a> {
    fn new(xml: &'a [u8]) -> Self {
        Self {
            reader: Reader::from_reader(xml),
        }
    }

    fn malformed(&self, reason: impl fmt::Display) -> DecodeError {
        DecodeError::malformed(self.reader.buffer_position(), reason)
    }

    fn next_event(&mut self) -> Result<Event<'a>, DecodeError> {
        self.reader.read_event().map_err(|err| self.malformed(err))
    }

    fn root(&mut self) -> Result<ScanRun, DecodeError> {
        loop {
            match self.next_event()? {
                Event::Start(start) => return self.scan_run(&Element { start, empty: false }),
                Event::Empty(start) => return self.scan_run(&Element { start, empty: true }),
                Event::Eof => return Err(self.malformed("document has no root element")),
                _ => {}
            }
        }
    }

    /// Visits every direct child of `element` and returns its direct
    /// character data. Each `on_child` call must consume the child entirely.
    fn walk<F>(&mut self, element: &Element<'a>, mut on_child: F) -> Result<String, DecodeError>
    where
        F: FnMut(&mut Self, &Element<'a>) -> Result<(), DecodeError>,
    {
        let mut text = String::new();
        if element.empty {
            return Ok(text);
        }

        loop {
            match self.next_event()? {
                Event::Start(start) => on_child(self, &Element { start, empty: false })?,
                Event::Empty(start) => on_child(self, &Element { start, empty: true })?,
                Event::Text(content) => {
                    let unescaped = content.unescape().map_err(|err| self.malformed(err))?;
                    self.check_chars(&unescaped)?;
                    text.push_str(&unescaped);
                }
                Event::CData(content) => {
                    let raw = std::str::from_utf8(&content).map_err(|err| self.malformed(err))?;
                    self.check_chars(raw)?;
                    text.push_str(raw);
                }
                Event::End(_) => return Ok(text),
                Event::Eof => {
                    let name = String::from_utf8_lossy(element.start.name().into_inner());
                    return Err(self.malformed(format!("unexpected end of input inside <{name}>")));
                }
                _ => {}
            }
        }
    }

    fn children<F>(&mut self, element: &Element<'a>, on_child: F) -> Result<(), DecodeError>
    where
        F: FnMut(&mut Self, &Element<'a>) -> Result<(), DecodeError>,
    {
        self.walk(element, on_child).map(drop)
    }

    fn skip(&mut self, element: &Element<'a>) -> Result<(), DecodeError> {
        trace!(
            element = %String::from_utf8_lossy(element.start.name().into_inner()),
            "skipping unknown element"
        );
        if !element.empty {
            self.reader
                .read_to_end(element.start.name())
                .map_err(|err| self.malformed(err))?;
        }
        Ok(())
    }

    /// Direct character data of `element`; nested elements are skipped.
    fn text(&mut self, element: &Element<'a>) -> Result<String, DecodeError> {
        self.walk(element, |dec, child| dec.skip(child))
    }

    /// Raw inner markup of `element`, entities left as written.
    fn inner_markup(&mut self, element: &Element<'a>) -> Result<String, DecodeError> {
        if element.empty {
            return Ok(String::new());
        }
        let raw = self
            .reader
            .read_text(element.start.name())
            .map_err(|err| self.malformed(err))?;
        self.check_chars(&raw)?;
        Ok(raw.into_owned())
    }

    /// Rejects characters outside the XML `Char` production.
    fn check_chars(&self, value: &str) -> Result<(), DecodeError> {
        match value.chars().find(|&ch| !is_xml_char(ch)) {
            Some(ch) => Err(self.malformed(format!("invalid character U+{:04X}", u32::from(ch)))),
            None => Ok(()),
        }
    }

    fn attributes<const N: usize>(
        &self,
        element: &Element<'a>,
        keys: [&str; N],
    ) -> Result<[String; N], DecodeError> {
        let mut values: [String; N] = std::array::from_fn(|_| String::new());
        for attr in element.start.attributes() {
            let attr = attr.map_err(|err| self.malformed(err))?;
            if attr.value.contains(&b'<') {
                return Err(self.malformed("`<` is not allowed in attribute values"));
            }
            let value = attr.unescape_value().map_err(|err| self.malformed(err))?;
            self.check_chars(&value)?;

            let local = attr.key.local_name().into_inner();
            if let Some(slot) = keys.iter().position(|key| key.as_bytes() == local) {
                values[slot] = value.into_owned();
            }
        }
        Ok(values)
    }

    fn scan_run(&mut self, element: &Element<'a>) -> Result<ScanRun, DecodeError> {
        let [address, status] = self.attributes(element, ["address", "status"])?;
        let mut run = ScanRun {
            address,
            status,
            ..ScanRun::default()
        };

        self.children(element, |dec, child| match child.local_name() {
            b"names" => dec.children(child, |dec, entry| match entry.local_name() {
                b"name" => {
                    let name = dec.text(entry)?;
                    run.host_names.push(HostName { name });
                    Ok(())
                }
                _ => dec.skip(entry),
            }),
            b"fingerprints" => dec.children(child, |dec, os| match os.local_name() {
                b"os" => {
                    run.fingerprints.push(dec.fingerprint(os)?);
                    Ok(())
                }
                _ => dec.skip(os),
            }),
            b"tests" => dec.children(child, |dec, test| match test.local_name() {
                b"test" => {
                    run.tests.push(dec.test(test)?);
                    Ok(())
                }
                _ => dec.skip(test),
            }),
            b"endpoints" => dec.children(child, |dec, endpoint| match endpoint.local_name() {
                b"endpoint" => {
                    run.endpoints.push(dec.endpoint(endpoint)?);
                    Ok(())
                }
                _ => dec.skip(endpoint),
            }),
            _ => dec.skip(child),
        })?;

        Ok(run)
    }

    fn fingerprint(&mut self, element: &Element<'a>) -> Result<Fingerprint, DecodeError> {
        let [certainty, device_class, vendor, family, product, version] = self.attributes(
            element,
            ["certainty", "device-class", "vendor", "family", "product", "version"],
        )?;
        self.children(element, |dec, child| dec.skip(child))?;
        Ok(Fingerprint {
            certainty,
            device_class,
            vendor,
            family,
            product,
            version,
        })
    }

    fn test(&mut self, element: &Element<'a>) -> Result<Test, DecodeError> {
        let [id, key, status, scan_id, vulnerable_since, pci_compliance_status] = self.attributes(
            element,
            [
                "id",
                "key",
                "status",
                "scan-id",
                "vulnerable-since",
                "pci-compliance-status",
            ],
        )?;
        let mut paragraphs = Vec::new();
        self.children(element, |dec, child| match child.local_name() {
            b"Paragraph" => {
                paragraphs.push(dec.paragraph(child, 1)?);
                Ok(())
            }
            _ => dec.skip(child),
        })?;

        Ok(Test {
            id,
            key,
            status,
            scan_id,
            vulnerable_since,
            pci_compliance_status,
            paragraphs,
        })
    }

    fn paragraph(
        &mut self,
        element: &Element<'a>,
        depth: usize,
    ) -> Result<EvidenceNode, DecodeError> {
        if depth > MAX_EVIDENCE_DEPTH {
            return Err(self.malformed(format!(
                "Paragraph nesting exceeds {MAX_EVIDENCE_DEPTH} levels"
            )));
        }

        let mut paragraphs = Vec::new();
        let mut list_items = Vec::new();
        let text = self.walk(element, |dec, child| match child.local_name() {
            b"Paragraph" => {
                paragraphs.push(dec.paragraph(child, depth + 1)?);
                Ok(())
            }
            b"UnorderedList" => dec.children(child, |dec, item| match item.local_name() {
                b"ListItem" => {
                    let content = dec.inner_markup(item)?;
                    list_items.push(ListItem { content });
                    Ok(())
                }
                _ => dec.skip(item),
            }),
            _ => dec.skip(child),
        })?;

        Ok(EvidenceNode {
            text,
            paragraphs,
            list_items,
        })
    }

    fn endpoint(&mut self, element: &Element<'a>) -> Result<Endpoint, DecodeError> {
        let [protocol, port, status] = self.attributes(element, ["protocol", "port", "status"])?;
        let mut services = Vec::new();
        self.children(element, |dec, child| match child.local_name() {
            b"services" => dec.children(child, |dec, service| match service.local_name() {
                b"service" => {
                    services.push(dec.service(service)?);
                    Ok(())
                }
                _ => dec.skip(service),
            }),
            _ => dec.skip(child),
        })?;

        Ok(Endpoint {
            protocol,
            port,
            status,
            services,
        })
    }

    fn service(&mut self, element: &Element<'a>) -> Result<Service, DecodeError> {
        let [name] = self.attributes(element, ["name"])?;
        let mut service = Service {
            name,
            ..Service::default()
        };

        self.children(element, |dec, child| match child.local_name() {
            b"fingerprints" => dec.children(child, |dec, fp| match fp.local_name() {
                b"fingerprint" => {
                    service.fingerprints.push(dec.fingerprint(fp)?);
                    Ok(())
                }
                _ => dec.skip(fp),
            }),
            b"configuration" => dec.children(child, |dec, config| match config.local_name() {
                b"config" => {
                    let [name] = dec.attributes(config, ["name"])?;
                    let value = dec.text(config)?;
                    service.configurations.push(Configuration { name, value });
                    Ok(())
                }
                _ => dec.skip(config),
            }),
            b"tests" => dec.children(child, |dec, test| match test.local_name() {
                b"test" => {
                    service.tests.push(dec.test(test)?);
                    Ok(())
                }
                _ => dec.skip(test),
            }),
            _ => dec.skip(child),
        })?;

        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_minimal_host() {
        let xml = br#"<h address="10.0.0.1" status="alive"><names><name>host1</name></names></h>"#;
        let run = decode(xml).expect("minimal host decodes");

        assert_eq!(run.address, "10.0.0.1");
        assert_eq!(run.status, "alive");
        assert_eq!(
            run.host_names,
            vec![HostName {
                name: "host1".to_string()
            }]
        );
        assert!(run.fingerprints.is_empty());
        assert!(run.tests.is_empty());
        assert!(run.endpoints.is_empty());
    }

    #[test]
    fn missing_attributes_and_elements_are_empty() {
        let run = decode(b"<node/>").expect("bare root decodes");
        assert_eq!(run, ScanRun::default());

        let run = decode(br#"<node><fingerprints><os vendor="Linux"/></fingerprints></node>"#)
            .expect("partial fingerprint decodes");
        let fingerprint = &run.fingerprints[0];
        assert_eq!(fingerprint.vendor, "Linux");
        assert_eq!(fingerprint.certainty, "");
        assert_eq!(fingerprint.device_class, "");
        assert_eq!(fingerprint.version, "");
    }

    #[test]
    fn host_names_keep_document_order() {
        let xml = br#"<node>
            <names><name>b.example</name><name>a.example</name></names>
            <names><name>c.example</name></names>
        </node>"#;
        let run = decode(xml).expect("names decode");
        let names: Vec<&str> = run.host_names.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["b.example", "a.example", "c.example"]);
    }

    #[test]
    fn test_without_paragraphs_has_no_evidence() {
        let xml = br#"<node><tests><test id="ssh-weak" status="not-vulnerable"/></tests></node>"#;
        let run = decode(xml).expect("test decodes");
        assert_eq!(run.tests.len(), 1);
        assert_eq!(run.tests[0].id, "ssh-weak");
        assert_eq!(run.tests[0].status, "not-vulnerable");
        assert!(run.tests[0].paragraphs.is_empty());

        let xml = br#"<node><tests><test><Paragraph>
        </Paragraph><Paragraph/></test></tests></node>"#;
        let run = decode(xml).expect("blank paragraphs decode");
        assert_eq!(run.tests[0].paragraphs.len(), 2);
        assert!(run.tests[0].paragraphs.iter().all(EvidenceNode::is_empty));
    }

    #[test]
    fn nested_paragraph_keeps_list_items_verbatim() {
        let xml = br#"<node><tests><test id="t1" key="k" scan-id="4" vulnerable-since="20240101T000000" pci-compliance-status="fail">
<Paragraph>Outer<Paragraph>Inner text
<UnorderedList>
<ListItem>Found <b>bold</b> &amp; raw</ListItem>
<ListItem/>
<ListItem>plain</ListItem>
</UnorderedList>
</Paragraph> tail</Paragraph>
</test></tests></node>"#;
        let run = decode(xml).expect("evidence decodes");
        let test = &run.tests[0];
        assert_eq!(test.scan_id, "4");
        assert_eq!(test.vulnerable_since, "20240101T000000");
        assert_eq!(test.pci_compliance_status, "fail");
        assert_eq!(test.paragraphs.len(), 1);

        let outer = &test.paragraphs[0];
        assert_eq!(outer.text, "Outer tail");
        assert!(outer.list_items.is_empty());
        assert_eq!(outer.paragraphs.len(), 1);

        let inner = &outer.paragraphs[0];
        assert!(inner.text.starts_with("Inner text"));
        assert!(inner.paragraphs.is_empty());
        let items: Vec<&str> = inner.list_items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(items, ["Found <b>bold</b> &amp; raw", "", "plain"]);
    }

    #[test]
    fn paragraph_text_is_unescaped_and_includes_cdata() {
        let xml = br#"<node><tests><test><Paragraph>a &lt; b <![CDATA[<raw>]]></Paragraph></test></tests></node>"#;
        let run = decode(xml).expect("escaped text decodes");
        assert_eq!(run.tests[0].paragraphs[0].text, "a < b <raw>");
    }

    #[test]
    fn endpoint_services_configs_and_service_tests() {
        let xml = br#"<node address="192.168.1.5" status="alive">
  <endpoints>
    <endpoint protocol="tcp" port="22" status="open">
      <services>
        <service name="SSH">
          <fingerprints>
            <fingerprint certainty="0.90" product="OpenSSH" version="8.9p1"/>
          </fingerprints>
          <configuration>
            <config name="ssh.banner">SSH-2.0-OpenSSH_8.9p1</config>
            <config name="ssh.protocol.version">2.0</config>
          </configuration>
          <tests>
            <test id="ssh-cve-2023-48795" status="vulnerable-version"/>
          </tests>
        </service>
      </services>
    </endpoint>
    <endpoint protocol="udp" port="161" status="open"/>
  </endpoints>
</node>"#;
        let run = decode(xml).expect("endpoints decode");
        assert_eq!(run.endpoints.len(), 2);

        let ssh = &run.endpoints[0];
        assert_eq!((ssh.protocol.as_str(), ssh.port.as_str()), ("tcp", "22"));
        assert_eq!(ssh.services.len(), 1);
        let service = &ssh.services[0];
        assert_eq!(service.name, "SSH");
        assert_eq!(service.fingerprints[0].product, "OpenSSH");
        assert_eq!(service.fingerprints[0].certainty, "0.90");
        assert_eq!(
            service.configurations,
            vec![
                Configuration {
                    name: "ssh.banner".to_string(),
                    value: "SSH-2.0-OpenSSH_8.9p1".to_string(),
                },
                Configuration {
                    name: "ssh.protocol.version".to_string(),
                    value: "2.0".to_string(),
                },
            ]
        );
        assert_eq!(service.tests[0].id, "ssh-cve-2023-48795");

        let snmp = &run.endpoints[1];
        assert_eq!(snmp.protocol, "udp");
        assert!(snmp.services.is_empty());

        let ids: Vec<&str> = run.all_tests().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["ssh-cve-2023-48795"]);
    }

    #[test]
    fn unknown_elements_and_prefixes_are_tolerated() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<!-- exported report -->
<nx:node xmlns:nx="urn:example" nx:address="10.1.1.1">
  <software><fingerprint product="ignored"/></software>
  <nx:names><nx:name>prefixed</nx:name><alias>skip</alias></nx:names>
</nx:node>"#;
        let run = decode(xml).expect("prefixed document decodes");
        assert_eq!(run.address, "10.1.1.1");
        assert_eq!(run.host_names.len(), 1);
        assert_eq!(run.host_names[0].name, "prefixed");
        assert!(run.fingerprints.is_empty());
    }

    #[test]
    fn decoding_is_deterministic() {
        let xml = br#"<node address="a"><tests><test id="x"><Paragraph>p<Paragraph>q</Paragraph></Paragraph></test></tests></node>"#;
        let first = decode(xml).expect("first decode");
        let second = decode(xml).expect("second decode");
        assert_eq!(first, second);
    }

    #[test]
    fn unclosed_tag_is_malformed() {
        let err = decode(b"<node address=\"1\"><names><name>host1</name></node>")
            .expect_err("mismatched end tag must fail");
        assert!(matches!(err, DecodeError::MalformedInput { .. }));

        let err = decode(b"<node><names>").expect_err("truncated input must fail");
        assert!(matches!(err, DecodeError::MalformedInput { .. }));
        assert!(err.position() > 0);
    }

    fn assert_malformed(xml: &[u8]) -> DecodeError {
        let err = decode(xml).expect_err("input must be rejected");
        assert!(matches!(err, DecodeError::MalformedInput { .. }));
        err
    }

    #[test]
    fn control_characters_are_malformed() {
        let err = assert_malformed(b"<node><names><name>a\x01b</name></names></node>");
        assert!(err.to_string().contains("U+0001"));
        assert_malformed(
            b"<node><tests><test><Paragraph><![CDATA[\x1f]]></Paragraph></test></tests></node>",
        );
        assert_malformed(b"<node address=\"a&#1;b\"/>");
        assert_malformed(
            b"<node><tests><test><Paragraph><UnorderedList><ListItem>\x02</ListItem></UnorderedList></Paragraph></test></tests></node>",
        );
    }

    #[test]
    fn raw_lt_in_attribute_is_malformed() {
        assert_malformed(b"<node address=\"a<b\"/>");
        let run = decode(b"<node address=\"a&lt;b\"/>").expect("escaped lt is allowed");
        assert_eq!(run.address, "a<b");
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        assert_malformed(b"<node><names><name>\xff</name></names></node>");
        assert_malformed(b"<node address=\"\xff\"/>");
    }

    #[test]
    fn unknown_entity_is_malformed() {
        assert_malformed(b"<node><names><name>&foo;</name></names></node>");
    }

    #[test]
    fn bare_ampersand_is_malformed() {
        assert_malformed(b"<node><names><name>a & b</name></names></node>");
    }

    #[test]
    fn bad_attributes_are_malformed() {
        let err = assert_malformed(b"<node address=\"1\" address=\"2\"/>");
        assert!(err.to_string().contains("duplicate"));
        assert_malformed(b"<node address/>");
    }

    #[test]
    fn mismatched_tag_inside_list_item_is_malformed() {
        assert_malformed(
            b"<node><tests><test><Paragraph><UnorderedList><ListItem><b></i></ListItem></UnorderedList></Paragraph></test></tests></node>",
        );
    }

    #[test]
    fn list_item_entities_stay_opaque() {
        let xml = b"<node><tests><test><Paragraph><UnorderedList><ListItem>&bogus; &amp;</ListItem></UnorderedList></Paragraph></test></tests></node>";
        let run = decode(xml).expect("list item content is not unescaped");
        assert_eq!(run.tests[0].paragraphs[0].list_items[0].content, "&bogus; &amp;");
    }

    #[test]
    fn empty_input_is_malformed() {
        let err = decode(b"").expect_err("empty input must fail");
        assert!(err.to_string().contains("no root element"));
    }

    #[test]
    fn excessive_paragraph_nesting_is_rejected() {
        let depth = MAX_EVIDENCE_DEPTH + 1;
        let mut xml = String::from("<node><tests><test>");
        xml.push_str(&"<Paragraph>".repeat(depth));
        xml.push_str(&"</Paragraph>".repeat(depth));
        xml.push_str("</test></tests></node>");

        let err = decode(xml.as_bytes()).expect_err("deep nesting must fail");
        assert!(err.to_string().contains("nesting"));
    }
}
