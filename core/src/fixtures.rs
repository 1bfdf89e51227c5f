//! Shared test configuration.

use crate::data::syntax;
use crate::data::ConfigTree;
use crate::schema::softwire;


pub const SAMPLE_CONF: &str = r#"
softwire-config {
  name lwaftr;
  external-interface {
    ip 10.10.10.10;
    mac 12:12:12:12:12:12;
    next-hop { mac 68:68:68:68:68:68; }
  }
  internal-interface {
    ip 8:9:a:b:c:d:e:f;
    mac 22:22:22:22:22:22;
    next-hop { mac 44:44:44:44:44:44; }
  }
  binding-table {
    softwire { ipv4 178.79.150.233; psid 7850; b4-ipv6 127:11:12:13:14:15:16:128; br-address 8:9:a:b:c:d:e:f; port-set { psid-length 16; } }
    softwire { ipv4 178.79.150.15; psid 0; b4-ipv6 127:22:33:44:55:66:77:128; br-address 8:9:a:b:c:d:e:f; port-set { psid-length 4; } }
    softwire { ipv4 178.79.150.2; psid 7850; b4-ipv6 127:24:35:46:57:68:79:128; br-address 8:9:a:b:c:d:e:f; port-set { psid-length 16; } }
    softwire { ipv4 178.79.150.3; psid 4; b4-ipv6 127:14:25:36:47:58:69:128; br-address 8:9:a:b:c:d:e:f; port-set { psid-length 6; } }
  }
  instance {
    device 00:05.0;
    queue { id 0; external-interface { ip 10.10.10.10; } internal-interface { ip 8:9:a:b:c:d:e:f; } }
  }
}
"#;


pub fn sample_tree() -> ConfigTree {
    syntax::parse_document(&softwire::schema().root, SAMPLE_CONF).unwrap()
}
