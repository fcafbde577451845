#![no_main]
use libfuzzer_sys::fuzz_target;

use clusterdns::hosts::Hosts;
use clusterdns::protocol::types::DomainName;

fuzz_target!(|data: &str| {
    if let Ok(hosts) = Hosts::deserialise(data) {
        for name in hosts.v4.keys() {
            assert_eq!(
                Some(name),
                DomainName::from_dotted_string(&name.to_dotted_string()).as_ref()
            );
        }
    }
});
