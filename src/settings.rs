//! Connection strings are `;`-separated `key=value` pairs, e.g.,
//! `AccessKey=AKIA...;Secret Key=...;Region=us-east-1;Bucket=search`.
//! Keys are case-insensitive and accept a few spellings each; blank
//! segments, and segments without `=`, are skipped.
use std::fmt;
use std::str::FromStr;

use derivative::Derivative;

use crate::error::Error;
use crate::error::Result;

const ACCESS_KEY: &[&str] = &["AccessKey", "Access Key", "AccessKeyId", "Access Key Id", "Id"];
const SECRET_KEY: &[&str] = &[
    "SecretKey",
    "Secret Key",
    "SecretAccessKey",
    "Secret Access Key",
    "Secret",
];
const REGION: &[&str] = &["EndPoint", "End Point", "Region"];
const SERVICE_URL: &[&str] = &["Service", "Service Url", "ServiceUrl"];
const BUCKET: &[&str] = &["Bucket", "Bucket Name", "BucketName"];
const BUCKET_FOLDER: &[&str] = &["Folder", "Bucket Folder", "BucketFolder"];
const CATALOG: &[&str] = &["Catalog"];

fn is_one_of(key: &str, aliases: &[&str]) -> bool {
    aliases.iter().any(|alias| alias.eq_ignore_ascii_case(key))
}

/// Connection settings for an object store bucket.
///
/// `Debug` and `Display` never print the secret key.
#[derive(Clone, Default, Derivative, PartialEq, Eq)]
#[derivative(Debug)]
pub struct Settings {
    pub access_key: Option<String>,
    #[derivative(Debug = "ignore")]
    pub secret_key: Option<String>,
    pub region: Option<String>,
    pub service_url: Option<String>,
    pub bucket: Option<String>,
    pub bucket_folder: Option<String>,
    pub catalog: Option<String>,
}

impl Settings {
    /// Parses a connection string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Settings`] on the first unrecognised key.
    pub fn parse(connection_string: &str) -> Result<Settings> {
        let mut settings = Settings::default();

        for segment in connection_string.split(';') {
            let (key, value) = match segment.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => continue,
            };

            if !settings.set(key, value) {
                return Err(Error::Settings {
                    option: key.to_owned(),
                });
            }
        }

        Ok(settings)
    }

    /// Sets the option `key` to `value`.  Returns false if `key` is not
    /// a known option.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        let slot = if is_one_of(key, ACCESS_KEY) {
            &mut self.access_key
        } else if is_one_of(key, SECRET_KEY) {
            &mut self.secret_key
        } else if is_one_of(key, REGION) {
            &mut self.region
        } else if is_one_of(key, SERVICE_URL) {
            &mut self.service_url
        } else if is_one_of(key, BUCKET) {
            &mut self.bucket
        } else if is_one_of(key, BUCKET_FOLDER) {
            &mut self.bucket_folder
        } else if is_one_of(key, CATALOG) {
            &mut self.catalog
        } else {
            return false;
        };

        *slot = Some(value.to_owned());
        true
    }
}

impl FromStr for Settings {
    type Err = Error;

    fn from_str(connection_string: &str) -> Result<Settings> {
        Settings::parse(connection_string)
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options = [
            ("AccessKey", &self.access_key),
            ("Region", &self.region),
            ("ServiceUrl", &self.service_url),
            ("Bucket", &self.bucket),
            ("BucketFolder", &self.bucket_folder),
            ("Catalog", &self.catalog),
        ];

        for (key, value) in options.iter() {
            match value {
                Some(value) if !value.is_empty() => write!(f, "{}={};", key, value)?,
                _ => {}
            }
        }

        Ok(())
    }
}

#[test]
fn test_parse_aliases() {
    let settings = Settings::parse(
        "access key id = AKIA; Secret Access Key=s3cr3t;End Point=us-east-1;\
         ServiceUrl=http://localhost:9000;bucket name=search;Folder=tenant/a;Catalog=main",
    )
    .expect("must parse");

    assert_eq!(
        settings,
        Settings {
            access_key: Some("AKIA".into()),
            secret_key: Some("s3cr3t".into()),
            region: Some("us-east-1".into()),
            service_url: Some("http://localhost:9000".into()),
            bucket: Some("search".into()),
            bucket_folder: Some("tenant/a".into()),
            catalog: Some("main".into()),
        }
    );
}

#[test]
fn test_parse_skips_junk() {
    let settings: Settings = ";;no equals sign; Id=x=y ;".parse().expect("must parse");

    // Only the first `=` separates the key from the value.
    assert_eq!(settings.access_key.as_deref(), Some("x=y"));
    assert_eq!(settings.bucket, None);
}

#[test]
fn test_parse_unknown() {
    assert!(matches!(Settings::parse("Bucket=a;Color=blue"),
                     Err(Error::Settings { option }) if option == "Color"));
}

#[test]
fn test_display_hides_secret() {
    let settings = Settings::parse("Id=AKIA;Secret=hunter2;Region=eu-west-1;Bucket=b")
        .expect("must parse");

    assert_eq!(settings.to_string(), "AccessKey=AKIA;Region=eu-west-1;Bucket=b;");
    assert!(!format!("{:?}", settings).contains("hunter2"));

    // Rendered settings parse back to themselves, minus the secret.
    let reparsed = Settings::parse(&settings.to_string()).expect("must parse");
    assert_eq!(
        reparsed,
        Settings {
            secret_key: None,
            ..settings
        }
    );
}
