// service.rs — Well-known destination ports.

/// Service label for a destination port; "OTHER" when unknown.
pub fn classify_port(port: u16) -> &'static str {
    match port {
        20 => "FTP-DATA",
        21 => "FTP",
        22 => "SSH",
        25 | 587 => "SMTP",
        465 => "SMTPS",
        53 => "DNS",
        69 => "TFTP",
        80 | 8080 => "HTTP",
        443 | 8443 => "HTTPS",
        110 => "POP3",
        995 => "POP3S",
        123 => "NTP",
        143 => "IMAP",
        993 => "IMAPS",
        161 | 162 => "SNMP",
        389 => "LDAP",
        636 => "LDAPS",
        1080 => "SOCKS",
        1433 => "MSSQL",
        3306 => "MYSQL",
        3389 => "RDP",
        5222 | 5269 => "XMPP",
        5432 => "POSTGRES",
        6379 => "REDIS",
        27017 => "MONGODB",
        _ => "OTHER",
    }
}
