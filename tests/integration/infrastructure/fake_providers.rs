use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tlsinterop::catalog::{Catalog, OcspFixtures};
use tlsinterop::provider::ProviderPaths;

/// How the fake binaries misbehave, if at all
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeBehavior {
    /// Clients never print anything and never exit
    pub client_hangs: bool,
    /// Clients exit non-zero after sending the payload
    pub client_fails: bool,
    /// Servers accept the connection but never echo the payload
    pub server_drops_payload: bool,
}

/// Shell scripts standing in for s2nc, s2nd, openssl, gnutls-cli and
/// gnutls-serv, plus certificate and OCSP fixtures.
///
/// Clients and servers talk through files named after the port: the client
/// writes its stdin to `<port>.in`, the server waits for it and prints it.
/// Every invocation is appended to `spawned.log`.
pub struct FakeProviders {
    temp_dir: TempDir,
}

impl FakeProviders {
    pub fn new() -> Result<Self> {
        Self::with_behavior(FakeBehavior::default())
    }

    pub fn with_behavior(behavior: FakeBehavior) -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let fakes = Self { temp_dir };

        fs::create_dir_all(fakes.bin_dir())?;
        fs::create_dir_all(fakes.cert_dir().join("ocsp"))?;
        fs::create_dir_all(fakes.ocsp_dir())?;
        for name in [
            "server_cert.pem",
            "server_key.pem",
            "server_ecdsa_cert.pem",
            "server_ecdsa_key.pem",
        ] {
            fs::write(fakes.cert_dir().join("ocsp").join(name), b"fixture")?;
        }
        fs::write(fakes.ocsp_dir().join(OcspFixtures::RSA_RESPONSE), b"rsa response")?;
        fs::write(fakes.ocsp_dir().join(OcspFixtures::EC_RESPONSE), b"ecdsa response")?;

        fakes.write_script("s2nc", &fakes.s2n_client(behavior))?;
        fakes.write_script("s2nd", &fakes.s2n_server(behavior))?;
        fakes.write_script("openssl", &fakes.openssl(behavior))?;
        fakes.write_script("gnutls-cli", &fakes.gnutls_client(behavior))?;
        fakes.write_script("gnutls-serv", &fakes.gnutls_server(behavior))?;
        Ok(fakes)
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root().join("bin")
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.root().join("certs")
    }

    pub fn ocsp_dir(&self) -> PathBuf {
        self.root().join("ocsp_responses")
    }

    pub fn paths(&self) -> ProviderPaths {
        let bin = self.bin_dir();
        ProviderPaths {
            s2nc: bin.join("s2nc"),
            s2nd: bin.join("s2nd"),
            openssl: bin.join("openssl"),
            gnutls_cli: bin.join("gnutls-cli"),
            gnutls_serv: bin.join("gnutls-serv"),
        }
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::ocsp(&self.cert_dir(), &self.ocsp_dir())
    }

    /// Command lines of every fake that was started, in order
    pub fn spawned(&self) -> Vec<String> {
        fs::read_to_string(self.root().join("spawned.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn write_script(&self, name: &str, body: &str) -> Result<()> {
        let path = self.bin_dir().join(name);
        let script = format!(
            "#!/bin/sh\nDIR='{}'\necho \"{} $*\" >> \"$DIR/spawned.log\"\n{}",
            self.root().display(),
            name,
            body
        );
        fs::write(&path, script).with_context(|| format!("Failed to write {}", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    fn s2n_client(&self, behavior: FakeBehavior) -> String {
        let mut body = String::from("for port; do :; done\n");
        body.push_str(&client_body(
            behavior,
            "printf 's2n is ready\\n'",
            "case \" $* \" in *' -s '*) printf 'OCSP response received\\n' ;; esac",
        ));
        body
    }

    fn s2n_server(&self, behavior: FakeBehavior) -> String {
        let mut body = String::from("for port; do :; done\n");
        body.push_str(&server_body(behavior, "printf 'Listening on 127.0.0.1:%s\\n' \"$port\"", false));
        body
    }

    fn openssl(&self, behavior: FakeBehavior) -> String {
        let mut body = String::from(
            "prev=''\n\
             for a; do\n\
             \x20 case \"$prev\" in\n\
             \x20   -connect) port=${a##*:} ;;\n\
             \x20   -accept) port=$a ;;\n\
             \x20 esac\n\
             \x20 prev=$a\n\
             done\n\
             if [ \"$1\" = s_client ]; then\n",
        );
        body.push_str(&client_body(
            behavior,
            "printf 'Verify return code: 0 (ok)\\n'",
            "case \" $* \" in *' -status '*) printf 'OCSP Response Status: successful (0x0)\\n' ;; esac",
        ));
        body.push_str("fi\n");
        body.push_str(&server_body(behavior, "printf 'ACCEPT\\n'", false));
        body
    }

    fn gnutls_client(&self, behavior: FakeBehavior) -> String {
        let mut body = String::from(GNUTLS_PORT);
        body.push_str(&client_body(
            behavior,
            "printf '%s\\n' '- Simple Client Mode:'",
            "case \" $* \" in *' --disable-extensions '*) ;; \
             *) printf 'OCSP Response Information:\\n\\tResponse Status: Successful\\n' ;; esac",
        ));
        body
    }

    fn gnutls_server(&self, behavior: FakeBehavior) -> String {
        let mut body = String::from(GNUTLS_PORT);
        body.push_str(&server_body(
            behavior,
            "printf 'Echo Server listening on IPv4 0.0.0.0 port %s...done\\n' \"$port\"",
            true,
        ));
        body
    }
}

const GNUTLS_PORT: &str = "prev=''\nfor a; do\n  [ \"$prev\" = --port ] && port=$a\n  prev=$a\ndone\n";

fn client_body(behavior: FakeBehavior, ready: &str, ocsp: &str) -> String {
    if behavior.client_hangs {
        return "exec sleep 600\n".to_string();
    }
    let status = if behavior.client_fails { 1 } else { 0 };
    format!(
        "{ocsp}\n\
         {ready}\n\
         cat > \"$DIR/$port.tmp\"\n\
         mv \"$DIR/$port.tmp\" \"$DIR/$port.in\"\n\
         exit {status}\n"
    )
}

fn server_body(behavior: FakeBehavior, ready: &str, never_exits: bool) -> String {
    let echo = if behavior.server_drops_payload {
        "printf 'connection accepted\\n'"
    } else {
        "cat \"$DIR/$port.in\""
    };
    let finish = if never_exits {
        "printf 'Sent Packet[4] Alert(21) in epoch 2 and length: 24\\n' >&2\nexec sleep 600\n"
    } else {
        "exit 0\n"
    };
    format!(
        "{ready}\n\
         i=0\n\
         while [ ! -f \"$DIR/$port.in\" ]; do\n\
         \x20 i=$((i + 1))\n\
         \x20 [ $i -gt 200 ] && exit 3\n\
         \x20 sleep 0.05\n\
         done\n\
         {echo}\n\
         rm -f \"$DIR/$port.in\"\n\
         {finish}"
    )
}
