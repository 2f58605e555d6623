use spilink_common::DeviceConfig;

pub const DASHBOARD_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>SpiLink RX</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    .card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    .muted{color:#555}td{padding:.2rem .6rem}
    code{word-break:break-all}
  </style>
</head>
<body>
  <h1>SpiLink RX</h1>
  <div class="card">
    <table>
      <tr><td>Frames received</td><td id="rx">--</td></tr>
      <tr><td>SPI</td><td id="spi">--</td></tr>
      <tr><td>RSSI</td><td id="rssi">--</td></tr>
      <tr><td>MQTT</td><td id="mqtt">--</td></tr>
      <tr><td>Uptime</td><td id="uptime">--</td></tr>
      <tr><td>Free heap</td><td id="heap">--</td></tr>
    </table>
  </div>
  <div class="card">
    <p>Last payload</p>
    <p><code id="hex">--</code></p>
    <p><code id="ascii">--</code></p>
  </div>
  <p class="muted"><a href="/config">Configuration</a> &middot; <a href="/reboot">Reboot</a></p>
  <script>
    async function refresh(){
      const r=await fetch('/api/status');const s=await r.json();
      for(const k of ['rx','spi','rssi','mqtt','uptime','heap','hex','ascii'])
        document.getElementById(k).textContent=String(s[k]);
    }
    refresh();setInterval(refresh,2000);
  </script>
</body>
</html>
"#;

const CONFIG_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>SpiLink RX Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    label{display:block;margin:.5rem 0 .2rem}
    input[type=text],input[type=password],input[type=number]{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}.muted{color:#555}
  </style>
</head>
<body>
  <h1>SpiLink RX Setup</h1>
  <p class="muted">The node reboots a few seconds after saving.</p>
  <form method="post" action="/save"
        onsubmit="for(const n of ['pass','mw']){const f=this.elements[n];f.disabled=!f.value;}">
    <label>WiFi SSID</label><input name="ssid" type="text" value="__SSID__">
    <label>WiFi Password (leave blank to keep current)</label><input name="pass" type="password">
    <label>MQTT Host (blank disables telemetry)</label><input name="ms" type="text" value="__HOST__">
    <label>MQTT Port</label><input name="mp" type="number" min="1" max="65535" value="__PORT__">
    <label>MQTT Topic</label><input name="mt" type="text" value="__TOPIC__">
    <label>MQTT Username</label><input name="mu" type="text" value="__USER__">
    <label>MQTT Password (leave blank to keep current)</label><input name="mw" type="password">
    <button type="submit">Save &amp; Reboot</button>
  </form>
</body>
</html>
"#;

pub const SAVED_HTML: &str =
    "<html><body><h1>Saved</h1><p>Configuration stored; rebooting in 3 seconds.</p></body></html>";
pub const REBOOT_HTML: &str = "<html><body><h1>Rebooting</h1></body></html>";

pub fn render_config_page(config: &DeviceConfig) -> String {
    CONFIG_HTML
        .replace("__SSID__", &escape_attr(&config.wifi_ssid))
        .replace("__HOST__", &escape_attr(&config.mqtt_host))
        .replace("__PORT__", &config.mqtt_port.to_string())
        .replace("__TOPIC__", &escape_attr(&config.mqtt_topic))
        .replace("__USER__", &escape_attr(&config.mqtt_user))
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashboard_lists_payload_fields() {
        assert!(DASHBOARD_HTML.contains("id=\"rx\""));
        assert!(DASHBOARD_HTML.contains("id=\"hex\""));
        assert!(DASHBOARD_HTML.contains("id=\"ascii\""));
    }

    #[test]
    fn blank_passwords_are_withheld_from_submission() {
        // A disabled control is not submitted, so an untouched password
        // field keeps the stored value instead of clearing it.
        assert!(CONFIG_HTML.contains("f.disabled=!f.value"));
        assert!(CONFIG_HTML.contains("['pass','mw']"));
    }

    #[test]
    fn config_page_prefills_without_secrets() {
        let mut config = DeviceConfig::default();
        config.wifi_ssid = "lab<net>".to_string();
        config.wifi_pass = "hunter2".to_string();

        let page = render_config_page(&config);
        assert!(page.contains("value=\"lab&lt;net&gt;\""));
        assert!(!page.contains("hunter2"));
    }
}
